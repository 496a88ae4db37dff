use wiremq::core::address::{AddressList, BrokerAddress, HandlerKind, SelectionPolicy};
use wiremq::core::error::WireError;

#[test]
fn priority_list_iterates_in_parse_order() {
    let mut list =
        AddressList::parse("mqtcp://one:7676, mqtcp://two:7676 mqssl://three:7677").unwrap();
    list.select(SelectionPolicy::Priority);

    let hosts: Vec<_> = list.iter().map(|a| a.host.as_str()).collect();
    assert_eq!(hosts, ["one", "two", "three"]);
}

#[test]
fn random_list_keeps_multiset_and_shuffles_once() {
    let src = (0..16)
        .map(|i| format!("mqtcp://h{i}:7676"))
        .collect::<Vec<_>>()
        .join(",");
    let mut list = AddressList::parse(&src).unwrap();
    let mut original: Vec<_> = list.iter().map(|a| a.host.clone()).collect();

    list.select(SelectionPolicy::Random);
    let first_pass: Vec<_> = list.iter().map(|a| a.host.clone()).collect();

    // the order is fixed for the lifetime of the list
    for _ in 0..3 {
        let again: Vec<_> = list.iter().map(|a| a.host.clone()).collect();
        assert_eq!(first_pass, again);
    }

    // same addresses, no loss, no duplication
    let mut shuffled = first_pass;
    original.sort();
    shuffled.sort();
    assert_eq!(original, shuffled);
}

#[test]
fn malformed_token_rejects_whole_list_and_names_token() {
    let err = AddressList::parse("mqtcp://good:7676, mqtcp://bad:not-a-port").unwrap_err();
    match err {
        WireError::MalformedAddress { token, .. } => {
            assert_eq!(token, "mqtcp://bad:not-a-port");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn scheme_resolves_through_static_table() {
    assert_eq!(
        BrokerAddress::parse("mqtcp://h:1").unwrap().handler,
        HandlerKind::Tcp
    );
    assert_eq!(
        BrokerAddress::parse("mqssl://h:1").unwrap().handler,
        HandlerKind::Ssl
    );
    assert_eq!(
        BrokerAddress::parse("mqws://h:1").unwrap().handler,
        HandlerKind::WebSocket
    );
    assert_eq!(
        BrokerAddress::parse("https://gateway.example/tunnel").unwrap().handler,
        HandlerKind::Https
    );
    assert!(BrokerAddress::parse("gopher://h:1").is_err());
}

#[test]
fn behavior_string_parses_case_insensitively() {
    assert_eq!(
        "priority".parse::<SelectionPolicy>().unwrap(),
        SelectionPolicy::Priority
    );
    assert_eq!(
        "RANDOM".parse::<SelectionPolicy>().unwrap(),
        SelectionPolicy::Random
    );
    assert!(matches!(
        "ROUND_ROBIN".parse::<SelectionPolicy>(),
        Err(WireError::BadListBehavior(_))
    ));
}
