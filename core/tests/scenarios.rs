use nfctag::auth::desfire::CommMode;
use nfctag::auth::Cipher;
use nfctag::emulator::{
    Fault, ForeignTag, VirtualDesfire, VirtualFeliCa, VirtualField, VirtualOpener, VirtualTopaz,
    VirtualUltralight, VirtualVicinity,
};
use nfctag::session::descriptor;
use nfctag::tag::desfire::AccessRights;
use nfctag::tag::ultralight::Model;
use nfctag::{
    Credentials, Error, NdefMessage, NdefRecord, OperationKind, Range, ReaderSelector, Session,
    SessionEvent, SessionOptions, SessionState, TagFamily,
};

const UID7: [u8; 7] = [0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
const UID4: [u8; 4] = [0x11, 0x22, 0x33, 0x44];
const UID8: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x04, 0xE0];
const IDM: [u8; 8] = [0x01, 0x2E, 0x3C, 0x4D, 0x5E, 0x6F, 0x70, 0x81];

const APP: u32 = 0x000002;
const OTHER_APP: u32 = 0x000003;
const KEY: [u8; 16] = [0x42; 16];

fn connect(field: &VirtualField) -> Session {
    let mut session = Session::with_opener(
        ReaderSelector::Auto,
        SessionOptions::default(),
        Box::new(VirtualOpener::new(field.clone())),
    );
    session.connect().unwrap();
    session
}

fn desfire_card() -> VirtualDesfire {
    VirtualDesfire::new(UID7)
        .with_application(APP, Cipher::Aes, vec![vec![0u8; 16], KEY.to_vec()])
        .with_application(OTHER_APP, Cipher::Aes, vec![vec![0u8; 16]])
        .with_file(APP, 1, CommMode::Plain, AccessRights::new(0xE, 0x1, 0x1, 0x0), vec![0u8; 32])
        .with_file(APP, 2, CommMode::Plain, AccessRights::new(0x1, 0x1, 0x1, 0x0), vec![0x5A; 16])
}

fn desfire_key(key_no: u8, key: &[u8]) -> Credentials {
    Credentials::Desfire {
        key_no,
        cipher: Cipher::Aes,
        key: key.to_vec(),
    }
}

fn topaz() -> VirtualField {
    VirtualField::with_tag(VirtualTopaz::new(UID4))
}

fn ntag213() -> VirtualField {
    VirtualField::with_tag(VirtualUltralight::new(UID7, Model::Ntag213))
}

fn felica() -> VirtualField {
    VirtualField::with_tag(VirtualFeliCa::new(IDM, 8))
}

fn desfire_ndef() -> VirtualField {
    VirtualField::with_tag(VirtualDesfire::new(UID7).with_ndef_application(256))
}

fn vicinity() -> VirtualField {
    VirtualField::with_tag(VirtualVicinity::new(UID8, 64, 4))
}

fn every_family() -> Vec<fn() -> VirtualField> {
    vec![topaz as fn() -> VirtualField, ntag213, felica, desfire_ndef, vicinity]
}

#[test]
fn ntag213_write_then_read() {
    let field = ntag213();
    let mut session = connect(&field);

    let info = session.get_info().unwrap();
    assert_eq!(TagFamily::Type2Ultralight, info.family);
    assert_eq!(144, info.memory_size);
    assert_eq!(SessionState::TagPresent, session.state());

    session.write(Range::new(0, 4), &[1, 2, 3, 4]).unwrap();
    assert_eq!(vec![1, 2, 3, 4], session.read(Range::new(0, 4)).unwrap());
}

#[test]
fn locked_vicinity_block_refuses_writes() {
    let field = VirtualField::with_tag(VirtualVicinity::new(UID8, 16, 4));
    let mut session = connect(&field);

    let report = session.lock(Range::blocks(2, 1, 4)).unwrap();
    assert_eq!(vec![2], report.blocks);
    assert!(matches!(
        session.write(Range::blocks(2, 1, 4), &[9, 9, 9, 9]),
        Err(Error::BlockLocked(2))
    ));
    assert_eq!(vec![2], session.get_info().unwrap().locked_blocks);
}

#[test]
fn locked_ultralight_page_refuses_writes() {
    let field = ntag213();
    let mut session = connect(&field);

    let preview = session.preview_lock(Range::new(4, 4)).unwrap();
    session.write(Range::new(4, 4), &[5, 6, 7, 8]).unwrap();

    let report = session.lock(Range::new(4, 4)).unwrap();
    assert_eq!(preview, report);
    assert!(matches!(
        session.write(Range::new(4, 4), &[0, 0, 0, 0]),
        Err(Error::BlockLocked(5))
    ));

    // Lock bits survive a new activation.
    session.release_tag();
    assert!(matches!(
        session.write(Range::new(4, 4), &[0, 0, 0, 0]),
        Err(Error::BlockLocked(5))
    ));
    assert_eq!(vec![5, 6, 7, 8], session.read(Range::new(4, 4)).unwrap());
}

#[test]
fn desfire_write_requires_the_write_key() {
    let field = VirtualField::with_tag(desfire_card());
    let mut session = connect(&field);

    let denied = session.desfire(OperationKind::Write, |d, l| {
        d.select_application(l, APP)?;
        d.write_file(l, 1, 0, &[1, 2, 3, 4])
    });
    assert!(matches!(denied, Err(Error::AuthenticationRequired)));

    session.authenticate(&desfire_key(1, &KEY)).unwrap();
    session
        .desfire(OperationKind::Write, |d, l| d.write_file(l, 1, 0, &[1, 2, 3, 4]))
        .unwrap();

    let data = session
        .desfire(OperationKind::Read, |d, l| d.read_file(l, 1, Range::new(0, 4)))
        .unwrap();
    assert_eq!(vec![1, 2, 3, 4], data);
}

#[test]
fn desfire_wrong_key_leaves_the_session_unauthenticated() {
    let field = VirtualField::with_tag(desfire_card());
    let mut session = connect(&field);

    session
        .desfire(OperationKind::Select, |d, l| d.select_application(l, APP))
        .unwrap();
    assert!(matches!(
        session.authenticate(&desfire_key(1, &[0x24; 16])),
        Err(Error::AuthenticationFailed)
    ));
    assert!(matches!(
        session.desfire(OperationKind::Write, |d, l| d.write_file(l, 1, 0, &[1])),
        Err(Error::AuthenticationRequired)
    ));
    assert!(matches!(
        session.desfire(OperationKind::Read, |d, l| d.read_file(l, 2, Range::new(0, 4))),
        Err(Error::AuthenticationRequired)
    ));

    session.authenticate(&desfire_key(1, &KEY)).unwrap();
    let data = session
        .desfire(OperationKind::Read, |d, l| d.read_file(l, 2, Range::new(0, 4)))
        .unwrap();
    assert_eq!(vec![0x5A; 4], data);
}

#[test]
fn desfire_application_switch_ends_authentication() {
    let field = VirtualField::with_tag(desfire_card());
    let mut session = connect(&field);

    session
        .desfire(OperationKind::Select, |d, l| d.select_application(l, APP))
        .unwrap();
    session.authenticate(&desfire_key(1, &KEY)).unwrap();
    assert!(session
        .desfire(OperationKind::Select, |d, _| Ok(d.is_authenticated()))
        .unwrap());

    session
        .desfire(OperationKind::Select, |d, l| d.select_application(l, OTHER_APP))
        .unwrap();
    assert!(!session
        .desfire(OperationKind::Select, |d, _| Ok(d.is_authenticated()))
        .unwrap());

    session
        .desfire(OperationKind::Select, |d, l| d.select_application(l, APP))
        .unwrap();
    assert!(matches!(
        session.desfire(OperationKind::Write, |d, l| d.write_file(l, 1, 0, &[1])),
        Err(Error::AuthenticationRequired)
    ));
}

#[test]
fn foreign_tag_is_left_alone() {
    let field = VirtualField::with_tag(ForeignTag::new(&UID4));
    let mut session = connect(&field);

    assert!(matches!(session.poll(), Err(Error::UnsupportedTag)));
    assert_eq!(SessionState::Listening, session.state());
    assert!(session.tag().is_none());

    assert!(matches!(session.read(Range::new(0, 4)), Err(Error::UnsupportedTag)));
    assert_eq!(SessionState::Listening, session.state());
}

#[test]
fn read_is_retried_once_after_a_timeout() {
    let field = ntag213();
    let mut session = connect(&field);
    session.write(Range::new(0, 4), &[1, 2, 3, 4]).unwrap();
    session.release_tag();

    field.inject(Fault::Timeout);
    assert_eq!(vec![1, 2, 3, 4], session.read(Range::new(0, 4)).unwrap());
    assert_eq!(2, field.opens());
    assert_eq!(SessionState::TagPresent, session.state());
}

#[test]
fn write_is_not_retried_after_a_timeout() {
    let field = ntag213();
    let mut session = connect(&field);
    session.get_info().unwrap();

    field.inject(Fault::Timeout);
    assert!(matches!(
        session.write(Range::new(0, 4), &[1, 2, 3, 4]),
        Err(Error::Timeout)
    ));
    assert_eq!(2, field.opens());
    assert_ne!(vec![1, 2, 3, 4], session.read(Range::new(0, 4)).unwrap());
}

#[test]
fn read_that_times_out_twice_drops_the_tag() {
    let field = ntag213();
    let mut session = connect(&field);
    session.write(Range::new(0, 4), &[1, 2, 3, 4]).unwrap();

    field.inject(Fault::Timeout);
    field.inject(Fault::Timeout);
    assert!(matches!(session.read(Range::new(0, 4)), Err(Error::Timeout)));
    assert_eq!(3, field.opens());
    assert_eq!(SessionState::Connected, session.state());
    assert!(session.tag().is_none());

    assert_eq!(vec![1, 2, 3, 4], session.read(Range::new(0, 4)).unwrap());
    assert_eq!(3, field.opens());
    assert_eq!(SessionState::TagPresent, session.state());
}

#[test]
fn lost_field_invalidates_the_tag() {
    let field = ntag213();
    let mut session = connect(&field);
    let events = session.subscribe();
    session.get_info().unwrap();

    field.inject(Fault::FieldLost);
    assert!(matches!(session.read(Range::new(0, 4)), Err(Error::FieldLost)));
    assert_eq!(SessionState::Listening, session.state());
    assert!(session.tag().is_none());

    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(Some(&SessionEvent::TagRemoved), events.last());
}

#[test]
fn unplugged_reader_disconnects() {
    let field = ntag213();
    let mut session = connect(&field);
    session.get_info().unwrap();

    field.inject(Fault::Transport);
    assert!(matches!(session.read(Range::new(0, 4)), Err(Error::Transport(_))));
    assert_eq!(SessionState::Disconnected, session.state());
    assert!(matches!(session.read(Range::new(0, 4)), Err(Error::NotConnected)));
}

#[test]
fn reader_change_disconnects() {
    let field = ntag213();
    let mut session = connect(&field);
    session.poll().unwrap();
    assert_eq!(SessionState::TagPresent, session.state());

    let events = session.subscribe();
    let reader = descriptor::find("PN532").unwrap();
    session.set_reader(ReaderSelector::Descriptor(reader));

    assert_eq!(SessionState::Disconnected, session.state());
    assert!(session.tag().is_none());
    assert_eq!(vec![SessionEvent::Disconnected], events.try_iter().collect::<Vec<_>>());

    session.connect().unwrap();
    assert_eq!(Some(nfctag::BackendKind::Uart), session.backend_kind());
    assert_eq!(Some("PN532 (UART)"), session.reader_name());
}

#[test]
fn auto_falls_through_to_the_next_backend() {
    let field = ntag213();
    let opener = VirtualOpener::only(field.clone(), vec![nfctag::BackendKind::Uart]);
    let mut session = Session::with_opener(ReaderSelector::Auto, SessionOptions::default(), Box::new(opener));

    session.connect().unwrap();
    assert_eq!(Some(nfctag::BackendKind::Uart), session.backend_kind());

    let nothing = VirtualOpener::only(field, Vec::new());
    let mut session = Session::with_opener(ReaderSelector::Auto, SessionOptions::default(), Box::new(nothing));
    assert!(matches!(session.connect(), Err(Error::NoReaderFound)));
    assert_eq!(SessionState::Disconnected, session.state());
}

#[test]
fn every_family_reports_its_memory() {
    for make in every_family() {
        let field = make();
        let mut session = connect(&field);

        let info = session.get_info().unwrap();
        assert!(info.memory_size > 0, "{} reports no memory", info.family);
        assert!(info.block_size > 0);
    }
}

#[test]
fn reads_are_idempotent() {
    for make in every_family() {
        let field = make();
        let mut session = connect(&field);

        let first = session.read(Range::new(0, 16)).unwrap();
        let second = session.read(Range::new(0, 16)).unwrap();
        assert_eq!(first, second);
    }
}

#[test]
fn ndef_round_trips_on_every_family() {
    let message = NdefMessage::new(vec![
        NdefRecord::text("en", "hello"),
        NdefRecord::uri("https://example.com"),
    ]);

    for make in every_family() {
        let field = make();
        let mut session = connect(&field);

        assert!(session.read_ndef().unwrap().is_empty());
        session.write_ndef(&message).unwrap();

        let family = session.get_info().unwrap().family;
        session.release_tag();
        assert_eq!(message, session.read_ndef().unwrap(), "{}", family);
    }
}

#[test]
fn out_of_range_access_is_rejected() {
    let field = ntag213();
    let mut session = connect(&field);

    assert!(matches!(
        session.read(Range::new(140, 8)),
        Err(Error::InvalidRange { offset: 140, len: 8 })
    ));
    assert!(matches!(
        session.write(Range::new(144, 1), &[0]),
        Err(Error::InvalidRange { .. })
    ));
}

#[test]
fn zero_length_access_is_empty() {
    for make in every_family() {
        let field = make();
        let mut session = connect(&field);
        let family = session.get_info().unwrap().family;

        for offset in [0, 5, 6, 7] {
            assert_eq!(
                Vec::<u8>::new(),
                session.read(Range::new(offset, 0)).unwrap(),
                "{} at {}",
                family,
                offset
            );
            session.write(Range::new(offset, 0), &[]).unwrap();
        }
        assert_eq!(SessionState::TagPresent, session.state());
    }
}

#[test]
fn felica_selected_service_has_its_own_blocks() {
    let field = VirtualField::with_tag(VirtualFeliCa::new(IDM, 2).with_service(0x1009, 8));
    let mut session = connect(&field);
    assert_eq!(48, session.get_info().unwrap().memory_size);

    session
        .felica(OperationKind::Select, |d, l| d.select_service(l, 0x1009))
        .unwrap();
    session.write(Range::new(80, 16), &[7; 16]).unwrap();
    session.write(Range::new(120, 8), &[9; 8]).unwrap();
    assert_eq!(vec![7; 16], session.read(Range::new(80, 16)).unwrap());
    assert_eq!(vec![9; 8], session.read(Range::new(120, 8)).unwrap());
    assert!(matches!(
        session.read(Range::new(128, 16)),
        Err(Error::InvalidRange { offset: 128, len: 16 })
    ));
    assert!(matches!(
        session.write(Range::new(120, 16), &[0; 16]),
        Err(Error::InvalidRange { offset: 120, len: 16 })
    ));

    session
        .felica(OperationKind::Select, |d, _| {
            d.select_ndef_service();
            Ok(())
        })
        .unwrap();
    assert!(matches!(
        session.read(Range::new(80, 16)),
        Err(Error::InvalidRange { .. })
    ));
    assert!(session.read_ndef().unwrap().is_empty());
}

#[test]
fn ndef_round_trips_short_and_long_records() {
    let records = vec![
        NdefRecord::mime("application/octet-stream", vec![0x5A; 600]),
        NdefRecord::text("en", "short"),
        NdefRecord::external("example.com:blob", vec![0xC3; 300]),
        NdefRecord::uri("https://example.com/a"),
        NdefRecord::mime("text/plain", b"plain".to_vec()),
    ];
    let fields: [fn() -> VirtualField; 2] = [
        || VirtualField::with_tag(VirtualDesfire::new(UID7).with_ndef_application(2048)),
        || VirtualField::with_tag(VirtualFeliCa::new(IDM, 96)),
    ];

    for make in fields {
        let field = make();
        let mut session = connect(&field);

        for n in 1..=records.len() {
            let message = NdefMessage::new(records[..n].to_vec());
            session.write_ndef(&message).unwrap();

            session.release_tag();
            assert_eq!(message, session.read_ndef().unwrap(), "{} records", n);
        }
    }
}

#[test]
fn oversized_ndef_message_is_refused() {
    let field = topaz();
    let mut session = connect(&field);

    let message = NdefMessage::new(vec![NdefRecord::text("en", &"x".repeat(200))]);
    assert!(matches!(
        session.write_ndef(&message),
        Err(Error::InsufficientMemory { .. })
    ));
}

#[test]
fn capabilities_gate_operations() {
    let field = VirtualField::with_tag(VirtualFeliCa::new(IDM, 4));
    let mut session = connect(&field);

    assert!(!session.get_info().unwrap().capabilities.lock);
    assert!(matches!(
        session.lock(Range::new(0, 16)),
        Err(Error::UnsupportedOperation {
            family: TagFamily::Type3FeliCa,
            operation: OperationKind::Lock,
        })
    ));
}
