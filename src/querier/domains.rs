//! Which questions go to multicast responders and which to unicast resolvers.

use std::sync::OnceLock;

use hickory_proto::op::Message;
use hickory_proto::rr::Name;

/// Domains resolved over multicast (RFC 6762 §3, §4).
pub const MULTICAST_DOMAINS: &[&str] = &[
    "local.",
    "254.169.in-addr.arpa.",
    "8.e.f.ip6.arpa.",
    "9.e.f.ip6.arpa.",
    "a.e.f.ip6.arpa.",
    "b.e.f.ip6.arpa.",
];

fn multicast_zones() -> &'static [Name] {
    static ZONES: OnceLock<Vec<Name>> = OnceLock::new();
    ZONES.get_or_init(|| {
        MULTICAST_DOMAINS
            .iter()
            .filter_map(|d| Name::from_ascii(d).ok())
            .collect()
    })
}

/// Whether `name` lies in a multicast domain.
pub fn is_multicast_name(name: &Name) -> bool {
    multicast_zones().iter().any(|zone| zone.zone_of(name))
}

/// Whether any question of `message` targets a multicast domain.
pub fn is_multicast_query(message: &Message) -> bool {
    message.queries().iter().any(|q| is_multicast_name(q.name()))
}

/// Whether any question of `message` targets a unicast domain.
pub fn is_unicast_query(message: &Message) -> bool {
    message.queries().iter().any(|q| !is_multicast_name(q.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::RecordType;

    fn name(s: &str) -> Name {
        Name::from_ascii(s).unwrap()
    }

    #[test]
    fn test_multicast_names() {
        assert!(is_multicast_name(&name("printer.local.")));
        assert!(is_multicast_name(&name("_http._tcp.LOCAL.")));
        assert!(is_multicast_name(&name("local.")));
        assert!(is_multicast_name(&name("4.3.254.169.in-addr.arpa.")));
        assert!(is_multicast_name(&name(
            "1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.e.f.ip6.arpa."
        )));
        assert!(!is_multicast_name(&name("example.com.")));
        assert!(!is_multicast_name(&name("notlocal.")));
        assert!(!is_multicast_name(&name("4.3.2.1.in-addr.arpa.")));
    }

    #[test]
    fn test_mixed_query() {
        let mut message = Message::new();
        message.add_query(Query::query(name("host.local."), RecordType::A));
        assert!(is_multicast_query(&message));
        assert!(!is_unicast_query(&message));

        message.add_query(Query::query(name("example.com."), RecordType::A));
        assert!(is_multicast_query(&message));
        assert!(is_unicast_query(&message));

        let empty = Message::new();
        assert!(!is_multicast_query(&empty));
        assert!(!is_unicast_query(&empty));
    }
}
