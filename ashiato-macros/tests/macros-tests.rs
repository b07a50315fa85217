use ashiato_macros::StrEnum;
use core::str::FromStr;

#[derive(StrEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    #[str("tcp")]
    Tcp,
    #[str("udp")]
    Udp,
    Unknown,
}

#[derive(StrEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[str_enum(serde)]
enum Direction {
    #[str("ingress")]
    Inbound,
    #[str("egress")]
    Outbound,
    #[str("unknown")]
    Unknown,
}

#[test]
fn test_as_str() {
    assert_eq!(Transport::Tcp.as_str(), "tcp");
    assert_eq!(Transport::Udp.as_str(), "udp");
    // no attribute, the variant name is used
    assert_eq!(Transport::Unknown.as_str(), "Unknown");
    assert_eq!(Transport::Udp.to_string(), "udp");
}

#[test]
fn test_from_str() {
    assert_eq!(Transport::from_str("tcp"), Ok(Transport::Tcp));
    assert_eq!(Transport::from_str("Unknown"), Ok(Transport::Unknown));
    assert_eq!(
        Transport::from_str("sctp"),
        Err("unknown Transport string")
    );
}

#[test]
fn test_variants() {
    assert_eq!(
        Direction::variants(),
        [Direction::Inbound, Direction::Outbound, Direction::Unknown]
    );
    for v in Transport::variants() {
        assert_eq!(Transport::from_str(v.as_str()), Ok(v));
    }
}

#[test]
fn test_serde() {
    #[derive(serde::Serialize, serde::Deserialize)]
    struct Network {
        direction: Direction,
    }

    let json = serde_json::to_string(&Network {
        direction: Direction::Outbound,
    })
    .unwrap();
    assert_eq!(json, r#"{"direction":"egress"}"#);

    let n: Network = serde_json::from_str(r#"{"direction":"ingress"}"#).unwrap();
    assert_eq!(n.direction, Direction::Inbound);

    assert!(serde_json::from_str::<Network>(r#"{"direction":"sideways"}"#).is_err());
}
