//! Runs against a physical reader with a tag on it:
//! `cargo test --all-features --test hardware -- --ignored`

#![cfg(feature = "pcsc")]

use std::time::Duration;

use nfctag::{NdefMessage, NdefRecord, Range, ReaderSelector, Session, SessionOptions};

fn session() -> Session {
    let mut session = Session::new(ReaderSelector::Auto, SessionOptions::default());
    session.connect().unwrap();
    session.wait_for_tag(Duration::from_secs(10)).unwrap();
    session
}

#[test]
#[ignore = "requires hardware: any supported reader with a tag in the field"]
fn info_of_the_tag_in_the_field() {
    let mut session = session();
    let info = session.get_info().unwrap();

    assert!(!info.uid.is_empty());
    assert!(info.memory_size > 0);
}

#[test]
#[ignore = "requires hardware: any supported reader with a tag in the field"]
fn reads_are_stable() {
    let mut session = session();
    let first = session.read(Range::new(0, 16)).unwrap();

    session.release_tag();
    assert_eq!(first, session.read(Range::new(0, 16)).unwrap());
}

#[test]
#[ignore = "requires hardware: a writable NDEF tag in the field, its content is overwritten"]
fn ndef_round_trip() {
    let mut session = session();
    let message = NdefMessage::new(vec![NdefRecord::text("en", "nfctag")]);

    session.write_ndef(&message).unwrap();
    session.release_tag();
    assert_eq!(message, session.read_ndef().unwrap());
}
