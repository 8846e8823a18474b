//! In-process reader and tags.
//!
//! A [`VirtualField`] holds at most one [`VirtualTag`]. [`VirtualOpener`] hands out
//! [`VirtualReader`]s bound to that field, so a [`Session`](crate::Session) drives virtual
//! tags through exactly the same driver code as physical ones. Faults can be queued on the
//! field to exercise the recovery paths of the session.

mod desfire;
mod felica;
mod topaz;
mod ultralight;
mod vicinity;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::backend::{Backend, BackendKind, Opener, Signature};
use crate::error::{Error, Result, TransportError};
use crate::session::{ReaderDescriptor, TransportParams};
use crate::trace::debug;

pub use desfire::VirtualDesfire;
pub use felica::VirtualFeliCa;
pub use topaz::VirtualTopaz;
pub use ultralight::VirtualUltralight;
pub use vicinity::VirtualVicinity;

/// A tag living in memory.
pub trait VirtualTag: Send {
    /// What the tag reports when activated.
    fn signature(&self) -> Signature;

    /// Answers one tag-level frame.
    fn handle(&mut self, frame: &[u8]) -> Result<Vec<u8>>;

    /// Forgets the volatile state of an activation (selection, authentication).
    fn reset(&mut self) {}
}

impl VirtualTag for Box<dyn VirtualTag> {
    fn signature(&self) -> Signature {
        (**self).signature()
    }

    fn handle(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        (**self).handle(frame)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// A MIFARE Classic card: activates, but belongs to no supported family.
#[derive(Debug, Clone)]
pub struct ForeignTag {
    uid: Vec<u8>,
}

impl ForeignTag {
    pub fn new(uid: &[u8]) -> Self {
        Self { uid: uid.to_vec() }
    }
}

impl VirtualTag for ForeignTag {
    fn signature(&self) -> Signature {
        Signature::Iso14443A {
            atqa: 0x0004,
            sak: 0x08,
            uid: self.uid.clone(),
            ats: None,
        }
    }

    fn handle(&mut self, _frame: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Status(0x0000))
    }
}

/// Failures injected into the next exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Timeout,
    FieldLost,
    /// The reader is unplugged.
    Transport,
}

#[derive(Default)]
struct FieldState {
    tag: Option<Box<dyn VirtualTag>>,
    faults: VecDeque<Fault>,
    frames: usize,
    opens: usize,
}

/// The RF field shared by every reader opened from the same opener.
#[derive(Clone, Default)]
pub struct VirtualField {
    state: Arc<Mutex<FieldState>>,
}

impl VirtualField {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(tag: impl VirtualTag + 'static) -> Self {
        let field = Self::new();
        field.place(tag);
        field
    }

    fn lock(&self) -> MutexGuard<'_, FieldState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Puts a tag in the field, replacing the one there.
    pub fn place(&self, tag: impl VirtualTag + 'static) {
        self.lock().tag = Some(Box::new(tag));
    }

    /// Takes the tag out of the field.
    pub fn remove(&self) -> Option<Box<dyn VirtualTag>> {
        self.lock().tag.take()
    }

    pub fn is_occupied(&self) -> bool {
        self.lock().tag.is_some()
    }

    /// Queues a fault for the next exchange.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Frames exchanged with tags so far.
    pub fn frames(&self) -> usize {
        self.lock().frames
    }

    /// Readers opened on this field so far.
    pub fn opens(&self) -> usize {
        self.lock().opens
    }
}

/// A reader whose field is a [`VirtualField`].
pub struct VirtualReader {
    field: VirtualField,
    kind: BackendKind,
    name: String,
    active: bool,
    closed: bool,
}

impl VirtualReader {
    pub fn new(field: VirtualField, kind: BackendKind, name: impl Into<String>) -> Self {
        Self {
            field,
            kind,
            name: name.into(),
            active: false,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        match self.closed {
            true => Err(TransportError::Unavailable.into()),
            _ => Ok(()),
        }
    }
}

impl Backend for VirtualReader {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, _timeout: Duration) -> Result<Option<Signature>> {
        self.check_open()?;

        let mut state = self.field.lock();
        self.active = false;
        Ok(state.tag.as_mut().map(|tag| {
            tag.reset();
            self.active = true;
            tag.signature()
        }))
    }

    fn transceive(&mut self, frame: &[u8], _timeout: Duration) -> Result<Vec<u8>> {
        self.check_open()?;
        debug!("TX: {}", hex::encode(frame));

        let mut state = self.field.lock();
        state.frames += 1;

        match state.faults.pop_front() {
            Some(Fault::Timeout) => return Err(Error::Timeout),
            Some(Fault::FieldLost) => {
                self.active = false;
                return Err(Error::FieldLost);
            }
            Some(Fault::Transport) => {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "virtual reader unplugged",
                ))
                .into())
            }
            None => {}
        }

        let tag = match (self.active, state.tag.as_mut()) {
            (true, Some(tag)) => tag,
            _ => return Err(Error::FieldLost),
        };

        let rx = tag.handle(frame)?;
        debug!("RX: {}", hex::encode(&rx));
        Ok(rx)
    }

    fn release(&mut self) -> Result<()> {
        if let Some(tag) = self.field.lock().tag.as_mut() {
            tag.reset();
        }

        self.active = false;
        Ok(())
    }

    fn close(&mut self) {
        self.active = false;
        self.closed = true;
    }
}

/// Opens [`VirtualReader`]s on one field for the backend kinds it is told to answer.
#[derive(Clone)]
pub struct VirtualOpener {
    field: VirtualField,
    kinds: Vec<BackendKind>,
}

impl VirtualOpener {
    /// Answers for every backend kind.
    pub fn new(field: VirtualField) -> Self {
        Self::only(
            field,
            vec![
                BackendKind::Usb,
                BackendKind::Pcsc,
                BackendKind::Uart,
                BackendKind::Virtual,
            ],
        )
    }

    /// Answers only for `kinds`; every other backend reports no reader.
    pub fn only(field: VirtualField, kinds: Vec<BackendKind>) -> Self {
        Self { field, kinds }
    }
}

impl Opener for VirtualOpener {
    fn open(
        &self,
        kind: BackendKind,
        descriptor: Option<&ReaderDescriptor>,
        _params: &TransportParams,
    ) -> Result<Box<dyn Backend>> {
        if !self.kinds.contains(&kind) {
            return Err(TransportError::Unavailable.into());
        }

        self.field.lock().opens += 1;
        let name = descriptor
            .map(|d| d.name.clone())
            .unwrap_or_else(|| "Virtual reader".to_owned());

        Ok(Box::new(VirtualReader::new(self.field.clone(), kind, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_follows_field() {
        let field = VirtualField::new();
        let mut reader = VirtualReader::new(field.clone(), BackendKind::Virtual, "test");
        let timeout = Duration::from_millis(10);

        assert_eq!(None, reader.poll(timeout).unwrap());

        field.place(ForeignTag::new(&[1, 2, 3, 4]));
        assert!(matches!(reader.poll(timeout).unwrap(), Some(Signature::Iso14443A { sak: 0x08, .. })));

        field.remove();
        assert!(matches!(reader.transceive(&[0x30, 0x04], timeout), Err(Error::FieldLost)));
        assert_eq!(1, field.frames());
    }

    #[test]
    fn test_faults_are_consumed_in_order() {
        let field = VirtualField::with_tag(ForeignTag::new(&[1, 2, 3, 4]));
        let mut reader = VirtualReader::new(field.clone(), BackendKind::Virtual, "test");
        let timeout = Duration::from_millis(10);
        reader.poll(timeout).unwrap();

        field.inject(Fault::Timeout);
        field.inject(Fault::Transport);

        assert!(matches!(reader.transceive(&[0x00], timeout), Err(Error::Timeout)));
        assert!(matches!(reader.transceive(&[0x00], timeout), Err(Error::Transport(_))));
        assert!(matches!(reader.transceive(&[0x00], timeout), Err(Error::Status(_))));
    }

    #[test]
    fn test_opener_answers_only_for_its_kinds() {
        let field = VirtualField::new();
        let opener = VirtualOpener::only(field.clone(), vec![BackendKind::Uart]);
        let params = TransportParams::default();

        assert!(opener.open(BackendKind::Usb, None, &params).is_err());
        let reader = opener.open(BackendKind::Uart, None, &params).unwrap();

        assert_eq!(BackendKind::Uart, reader.kind());
        assert_eq!(1, field.opens());
    }
}
