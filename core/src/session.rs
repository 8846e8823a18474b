//! The reader session: one backend, at most one tag, and the state machine between them.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Listening <-> TagPresent
//!       ^                                                      |
//!       +------------- disconnect, transport failure ----------+
//! ```
//!
//! Every operation runs through [`Session::operate`], which activates a tag when none is
//! present and applies the recovery policy on failure: a lost field invalidates the tag,
//! a transport failure tears the connection down, and a timeout rebuilds the connection
//! and retries read operations once when the same tag comes back.

pub mod descriptor;

use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::auth::Credentials;
use crate::backend::{Backend, BackendKind, Opener, Signature, SystemOpener, AUTO_ORDER};
use crate::classify::classify;
use crate::error::{Error, Result};
use crate::ndef::NdefMessage;
use crate::tag::{
    Desfire, Driver, FeliCa, Link, LockReport, Operation, OperationKind, OperationResult, Range,
    TagFamily, TagInfo,
};
use crate::trace::{debug, info, warn};

pub use descriptor::{ReaderDescriptor, TransportParams, UsbId};

/// Which reader a session connects to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReaderSelector {
    /// Tries USB, PC/SC, then UART with every catalogued reader.
    #[default]
    Auto,
    Descriptor(ReaderDescriptor),
}

impl ReaderSelector {
    fn descriptor(&self) -> Option<&ReaderDescriptor> {
        match self {
            ReaderSelector::Auto => None,
            ReaderSelector::Descriptor(d) => Some(d),
        }
    }

    fn backends(&self) -> Vec<BackendKind> {
        match self {
            ReaderSelector::Auto => AUTO_ORDER.to_vec(),
            ReaderSelector::Descriptor(d) => d.backends.clone(),
        }
    }

    fn params(&self) -> TransportParams {
        self.descriptor().map(|d| d.params.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Listening,
    TagPresent,
}

/// State changes delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { backend: BackendKind, name: String },
    Disconnected,
    TagPresent { family: TagFamily, uid: Vec<u8> },
    TagRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Overrides the timeout of the reader's transport parameters.
    pub timeout: Option<Duration>,
    /// Pause between two polls while waiting for a tag.
    pub poll_interval: Duration,
    /// Keeps the tag activated between operations. When off, the tag is released after
    /// every operation and activated again by the next one.
    pub hold_tag: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::from_millis(200),
            hold_tag: true,
        }
    }
}

/// The tag activated in the field.
pub struct TagHandle {
    signature: Signature,
    family: TagFamily,
    driver: Driver,
}

impl TagHandle {
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn family(&self) -> TagFamily {
        self.family
    }

    pub fn uid(&self) -> &[u8] {
        self.signature.uid()
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }
}

impl Drop for TagHandle {
    fn drop(&mut self) {
        self.driver.invalidate();
    }
}

pub struct Session {
    selector: ReaderSelector,
    opener: Box<dyn Opener>,
    options: SessionOptions,
    state: SessionState,
    backend: Option<Box<dyn Backend>>,
    tag: Option<TagHandle>,
    subscribers: Vec<Sender<SessionEvent>>,
}

impl Session {
    /// Creates a disconnected session using the backends compiled into this build.
    pub fn new(selector: ReaderSelector, options: SessionOptions) -> Self {
        Self::with_opener(selector, options, Box::new(SystemOpener))
    }

    pub fn with_opener(selector: ReaderSelector, options: SessionOptions, opener: Box<dyn Opener>) -> Self {
        Self {
            selector,
            opener,
            options,
            state: SessionState::Disconnected,
            backend: None,
            tag: None,
            subscribers: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn selector(&self) -> &ReaderSelector {
        &self.selector
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn tag(&self) -> Option<&TagHandle> {
        self.tag.as_ref()
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    pub fn reader_name(&self) -> Option<&str> {
        self.backend.as_ref().map(|b| b.name())
    }

    fn timeout(&self) -> Duration {
        self.options
            .timeout
            .unwrap_or_else(|| self.selector.params().timeout())
    }

    /// Returns a channel receiving every later state change.
    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: SessionEvent) {
        debug!("Session event: {:?}", event);
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Opens the first backend of the selector that answers.
    pub fn connect(&mut self) -> Result<()> {
        if let Some(descriptor) = self.selector.descriptor() {
            descriptor.validate()?;
        }

        self.teardown();
        self.state = SessionState::Connecting;

        let params = self.selector.params();
        for kind in self.selector.backends() {
            match self.opener.open(kind, self.selector.descriptor(), &params) {
                Ok(backend) => {
                    info!("Connected to {} through {}", backend.name(), kind);
                    let event = SessionEvent::Connected {
                        backend: kind,
                        name: backend.name().to_owned(),
                    };

                    self.backend = Some(backend);
                    self.state = SessionState::Connected;
                    self.emit(event);
                    return Ok(());
                }
                Err(e) => debug!("No reader on the {} backend: {}", kind, e),
            }
        }

        self.state = SessionState::Disconnected;
        Err(Error::NoReaderFound)
    }

    /// Releases the tag and closes the backend.
    pub fn disconnect(&mut self) {
        self.teardown();
    }

    /// Switches to another reader. The session is left disconnected.
    pub fn set_reader(&mut self, selector: ReaderSelector) {
        self.teardown();
        self.selector = selector;
    }

    fn teardown(&mut self) {
        if let Some(mut tag) = self.tag.take() {
            tag.driver.invalidate();
            if let Some(backend) = self.backend.as_mut() {
                let _ = backend.release();
            }
        }

        let connected = match self.backend.take() {
            Some(mut backend) => {
                backend.close();
                true
            }
            None => false,
        };

        self.state = SessionState::Disconnected;
        if connected {
            self.emit(SessionEvent::Disconnected);
        }
    }

    /// Looks for a tag once. Returns the family of the tag activated, if any.
    /// A tag outside the supported families fails with `UnsupportedTag` and is left alone.
    pub fn poll(&mut self) -> Result<Option<TagFamily>> {
        if let Some(tag) = &self.tag {
            return Ok(Some(tag.family));
        }

        let timeout = self.timeout();
        let backend = self.backend.as_mut().ok_or(Error::NotConnected)?;
        self.state = SessionState::Listening;

        let signature = match backend.poll(timeout) {
            Ok(Some(signature)) => signature,
            Ok(None) | Err(Error::Timeout) => return Ok(None),
            Err(e) => return Err(self.settle(e)),
        };

        let family = match classify(&signature) {
            Ok(family) => family,
            Err(e) => {
                warn!("Ignoring unsupported tag {}", hex::encode(signature.uid()));
                let _ = backend.release();
                return Err(e);
            }
        };
        info!("{} tag in the field: {}", family, hex::encode(signature.uid()));

        let uid = signature.uid().to_vec();
        self.tag = Some(TagHandle {
            driver: Driver::new(family, &signature),
            signature,
            family,
        });
        self.state = SessionState::TagPresent;
        self.emit(SessionEvent::TagPresent { family, uid });

        Ok(Some(family))
    }

    /// Polls until a tag is activated or `timeout` elapses.
    pub fn wait_for_tag(&mut self, timeout: Duration) -> Result<TagFamily> {
        let deadline = Instant::now() + timeout;
        let mut notice = Instant::now();

        loop {
            if let Some(family) = self.poll()? {
                return Ok(family);
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }

            if notice.elapsed() >= Duration::from_secs(1) {
                info!("Still waiting for a tag...");
                notice = Instant::now();
            }

            sleep(self.options.poll_interval);
        }
    }

    /// Deselects the tag without waiting for it to leave.
    pub fn release_tag(&mut self) {
        if let Some(mut tag) = self.tag.take() {
            tag.driver.invalidate();
            if let Some(backend) = self.backend.as_mut() {
                if let Err(e) = backend.release() {
                    debug!("Release failed: {}", e);
                }
            }
            self.state = SessionState::Listening;
        }
    }

    fn tag_removed(&mut self) {
        if let Some(mut tag) = self.tag.take() {
            tag.driver.invalidate();
            self.state = SessionState::Listening;
            self.emit(SessionEvent::TagRemoved);
        }
    }

    /// Applies the recovery policy for `e` and hands it back.
    fn settle(&mut self, e: Error) -> Error {
        match &e {
            Error::FieldLost => {
                warn!("The tag left the field");
                self.tag_removed();
            }
            e if e.is_transport() => {
                warn!("Connection to the reader failed: {}", e);
                self.teardown();
            }
            _ if !self.options.hold_tag => self.release_tag(),
            _ => {}
        }

        e
    }

    /// Closes the backend and opens the same kind again. The tag handle does not survive.
    fn rebuild(&mut self) -> Result<()> {
        let Some(mut backend) = self.backend.take() else {
            return Err(Error::NotConnected);
        };
        let kind = backend.kind();

        if let Some(mut tag) = self.tag.take() {
            tag.driver.invalidate();
        }
        backend.close();

        let params = self.selector.params();
        match self.opener.open(kind, self.selector.descriptor(), &params) {
            Ok(backend) => {
                debug!("Rebuilt the {} connection", kind);
                self.backend = Some(backend);
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                self.emit(SessionEvent::Disconnected);
                Err(e)
            }
        }
    }

    fn run<T, F>(&mut self, f: &mut F) -> Result<T>
    where
        F: FnMut(&mut Driver, &mut Link) -> Result<T>,
    {
        let timeout = self.timeout();
        let (Some(backend), Some(tag)) = (self.backend.as_mut(), self.tag.as_mut()) else {
            return Err(Error::NoTag);
        };

        let mut link = Link::new(&mut **backend, timeout);
        f(&mut tag.driver, &mut link)
    }

    /// Runs `f` against the tag in the field, activating one first when needed.
    pub fn operate<T, F>(&mut self, kind: OperationKind, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Driver, &mut Link) -> Result<T>,
    {
        if self.backend.is_none() {
            return Err(Error::NotConnected);
        }
        if self.tag.is_none() {
            self.poll()?.ok_or(Error::NoTag)?;
        }

        let result = match self.run(&mut f) {
            Err(Error::Timeout) => self.retry_after_timeout(kind, &mut f),
            result => result,
        };

        match result {
            Ok(value) => {
                if !self.options.hold_tag {
                    self.release_tag();
                }
                Ok(value)
            }
            Err(e) => Err(self.settle(e)),
        }
    }

    fn retry_after_timeout<T, F>(&mut self, kind: OperationKind, f: &mut F) -> Result<T>
    where
        F: FnMut(&mut Driver, &mut Link) -> Result<T>,
    {
        let uid = self.tag.as_ref().map(|t| t.uid().to_vec());
        warn!("The {} operation timed out, rebuilding the connection", kind);

        self.rebuild()?;
        if !kind.is_read() {
            return Err(Error::Timeout);
        }

        match self.poll() {
            Ok(Some(_)) if self.tag.as_ref().map(|t| t.uid().to_vec()) == uid => {
                debug!("Same tag is back, retrying once");
                match self.run(f) {
                    Err(Error::Timeout) => {
                        warn!("The {} operation timed out again", kind);
                        self.rebuild()?;
                        Err(Error::Timeout)
                    }
                    result => result,
                }
            }
            Ok(_) => Err(Error::Timeout),
            Err(e) => Err(e),
        }
    }

    /// Runs one operation.
    pub fn execute(&mut self, operation: Operation) -> OperationResult {
        let kind = operation.kind();
        self.operate(kind, |driver, link| driver.execute(link, &operation))
    }

    pub fn get_info(&mut self) -> Result<TagInfo> {
        self.operate(OperationKind::GetInfo, |d, l| d.get_info(l))
    }

    pub fn read(&mut self, range: Range) -> Result<Vec<u8>> {
        self.operate(OperationKind::Read, |d, l| d.read(l, range))
    }

    pub fn write(&mut self, range: Range, data: &[u8]) -> Result<()> {
        self.operate(OperationKind::Write, |d, l| d.write(l, range, data))
    }

    pub fn lock(&mut self, range: Range) -> Result<LockReport> {
        self.operate(OperationKind::Lock, |d, l| d.lock(l, range))
    }

    pub fn preview_lock(&mut self, range: Range) -> Result<LockReport> {
        self.operate(OperationKind::Lock, |d, l| d.preview_lock(l, range))
    }

    pub fn format(&mut self) -> Result<()> {
        self.operate(OperationKind::Format, |d, l| d.format(l))
    }

    pub fn authenticate(&mut self, credentials: &Credentials) -> Result<()> {
        self.operate(OperationKind::Authenticate, |d, l| d.authenticate(l, credentials))
    }

    pub fn read_ndef(&mut self) -> Result<NdefMessage> {
        self.operate(OperationKind::ReadNdef, |d, l| d.read_ndef(l))
    }

    pub fn write_ndef(&mut self, message: &NdefMessage) -> Result<()> {
        self.operate(OperationKind::WriteNdef, |d, l| d.write_ndef(l, message))
    }

    /// Runs `f` against the DESFire driver of the tag in the field.
    pub fn desfire<T, F>(&mut self, kind: OperationKind, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Desfire, &mut Link) -> Result<T>,
    {
        self.operate(kind, |d, l| f(d.desfire()?, l))
    }

    /// Runs `f` against the FeliCa driver of the tag in the field.
    pub fn felica<T, F>(&mut self, kind: OperationKind, mut f: F) -> Result<T>
    where
        F: FnMut(&mut FeliCa, &mut Link) -> Result<T>,
    {
        self.operate(kind, |d, l| f(d.felica()?, l))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
