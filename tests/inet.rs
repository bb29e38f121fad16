use evio::{Family, InetAddress};

mod util;

#[test]
fn any_and_loopback_constructors() {
    util::init();
    assert_eq!(InetAddress::any(Family::V4).bytes(), &[0u8; 16]);
    assert_eq!(InetAddress::any(Family::V6).bytes(), &[0u8; 16]);

    assert_eq!(InetAddress::loopback(Family::V4).to_string(), "127.0.0.1");
    assert_eq!(InetAddress::loopback(Family::V6).to_string(), "::1");
}

#[test]
fn string_round_trip_preserves_address() {
    let cases = [
        "0.0.0.0",
        "127.0.0.1",
        "10.0.0.1",
        "255.255.255.255",
        "::",
        "::1",
        "fe80::1",
        "2001:db8::8:800:200c:417a",
        "ff02::2",
    ];
    for text in cases {
        let addr = InetAddress::from_string(text).expect(text);
        let round = InetAddress::from_string(&addr.to_string()).expect(text);
        assert_eq!(round, addr, "{}", text);
    }
}

#[test]
fn families_are_detected() {
    assert_eq!(
        InetAddress::from_string("192.168.0.1").unwrap().family(),
        Family::V4
    );
    assert_eq!(
        InetAddress::from_string("fe80::1").unwrap().family(),
        Family::V6
    );
}

#[test]
fn invalid_literals_are_rejected() {
    for text in ["", "localhost", "1.2.3", "1.2.3.4.5", "fe80:::1", "12345::1::2"] {
        assert!(InetAddress::from_string(text).is_none(), "{}", text);
    }
}

#[test]
fn from_bytes_zero_pads_v4() {
    let addr = InetAddress::from_bytes(Family::V4, &[1, 2, 3, 4]);
    assert_eq!(&addr.bytes()[..4], &[1, 2, 3, 4]);
    assert_eq!(&addr.bytes()[4..], &[0; 12]);
    assert_eq!(addr.to_string(), "1.2.3.4");
}
