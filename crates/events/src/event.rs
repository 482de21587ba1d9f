use chrono::{DateTime, Utc};

/// A fact the ledger announces after its write has been acknowledged.
///
/// Event types are dotted names, `<area>.<entity>.<what happened>`, e.g.
/// `ledger.transfer.recorded`. Subscribers route on the prefix.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;

    /// Payload schema version. Bump when a field changes meaning.
    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc>;

    /// What the event is about: a unit id or an item key.
    fn subject(&self) -> String;

    /// Leading segment of the event type (`ledger` for `ledger.unit.purged`).
    fn area(&self) -> &'static str {
        let ty = self.event_type();
        ty.split_once('.').map_or(ty, |(area, _)| area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Ping;

    impl Event for Ping {
        fn event_type(&self) -> &'static str {
            "ledger.health.ping"
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            DateTime::<Utc>::UNIX_EPOCH
        }

        fn subject(&self) -> String {
            "health-check".into()
        }
    }

    #[test]
    fn defaults_follow_the_event_type() {
        assert_eq!(Ping.version(), 1);
        assert_eq!(Ping.area(), "ledger");
    }
}
