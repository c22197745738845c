//! Remote-framebuffer session management.
//!
//! One [`RemoteDesktopSession`] per sandbox owns at most one live RFB
//! connection and exposes input/observation primitives that self-heal
//! across transport failure. The contract for every operation:
//!
//! - Any transport error invalidates the connection *before* the error
//!   is reported, so the next call transparently reconnects.
//! - Input calls never retry internally; the caller's step loop retries
//!   on its next tick.
//! - Frame capture retries inline and only gives up on an explicit
//!   timeout, so a capture call never surfaces a transport error.
//!
//! No operation has a precondition beyond "the session exists" — callers
//! never check connectivity first.

mod rfb;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

pub(crate) use rfb::RfbClient;

/// How long to wait between failed connection attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// Pixels with luminance below this value (out of 255) count as dark.
const DARK_LUMINANCE: f64 = 16.0;

/// A frame whose dark fraction exceeds this is still loading.
const MAX_DARK_FRACTION: f64 = 0.9;

/// Errors on the remote-desktop transport. These never cross the
/// session boundary except as the result of a single input call.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying socket failed.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The server broke protocol (or spoke one we do not support).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The server rejected the shared secret.
    #[error("authentication failed: {message}")]
    AuthFailed { message: String },

    /// The operation exceeded its internal deadline.
    #[error("transport operation timed out")]
    Timeout,

    /// There is no live connection to operate on.
    #[error("not connected")]
    Disconnected,
}

impl TransportError {
    /// Creates a `Protocol` error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an `AuthFailed` error.
    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthFailed {
            message: message.into(),
        }
    }
}

/// One captured screen region, tightly packed RGB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// `width * height * 3` bytes, row-major RGB.
    pub data: Vec<u8>,
}

impl Frame {
    /// An all-black frame, used when capture never succeeded within a
    /// caller's deadline.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * 3],
        }
    }

    /// Fraction of pixels darker than the loading threshold.
    pub fn dark_fraction(&self) -> f64 {
        if self.data.is_empty() {
            return 1.0;
        }
        let dark = self
            .data
            .chunks_exact(3)
            .filter(|px| {
                let lum = 0.2989 * f64::from(px[0])
                    + 0.5870 * f64::from(px[1])
                    + 0.1140 * f64::from(px[2]);
                lum < DARK_LUMINANCE
            })
            .count();
        dark as f64 / (self.data.len() / 3) as f64
    }

    /// Whether the frame looks fully rendered. A mostly-black screen is
    /// assumed to still be loading; exactly 90% dark is considered ready.
    pub fn is_ready(&self) -> bool {
        self.dark_fraction() <= MAX_DARK_FRACTION
    }
}

/// Low-level connection operations, behind a seam so the session logic
/// can be tested against a scripted transport.
#[async_trait]
pub(crate) trait FramebufferTransport: Send {
    async fn pointer_event(
        &mut self,
        button_mask: u8,
        x: u16,
        y: u16,
    ) -> Result<(), TransportError>;

    async fn key_event(&mut self, down: bool, keysym: u32) -> Result<(), TransportError>;

    async fn capture(
        &mut self,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    ) -> Result<Frame, TransportError>;
}

/// Produces fresh connections. Sessions replace a failed connection
/// wholesale via the connector; they never patch one in place.
#[async_trait]
pub(crate) trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FramebufferTransport>, TransportError>;
}

/// Connects to the VNC server of one sandbox.
pub(crate) struct RfbConnector {
    addr: String,
    password: String,
    connect_timeout: Duration,
}

impl RfbConnector {
    pub fn new(address: std::net::Ipv4Addr, port: u16, password: String, timeout: Duration) -> Self {
        Self {
            addr: format!("{address}:{port}"),
            password,
            connect_timeout: timeout,
        }
    }
}

#[async_trait]
impl Connector for RfbConnector {
    async fn connect(&self) -> Result<Box<dyn FramebufferTransport>, TransportError> {
        let client = RfbClient::connect(&self.addr, &self.password, self.connect_timeout).await?;
        Ok(Box::new(client))
    }
}

/// Screen geometry the session operates in: cursor coordinates live in
/// `[0, width) x [0, height)` below a reserved top margin.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub toolbar_margin: u32,
}

/// The remote-control session of one sandbox.
pub struct RemoteDesktopSession {
    connector: Box<dyn Connector>,
    connection: Option<Box<dyn FramebufferTransport>>,
    geometry: Geometry,
    /// Last cursor position confirmed by the server, in screen
    /// coordinates (margin included). `None` until the first probe.
    cursor: Option<(u16, u16)>,
    /// Button mask of an in-progress hold, 0 when nothing is held.
    /// Carried through cursor moves so drags stay drags.
    held_mask: u8,
}

impl RemoteDesktopSession {
    pub(crate) fn new(connector: Box<dyn Connector>, geometry: Geometry) -> Self {
        Self {
            connector,
            connection: None,
            geometry,
            cursor: None,
            held_mask: 0,
        }
    }

    /// Whether a live connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Whether a mouse hold is in progress.
    pub fn mouse_held(&self) -> bool {
        self.held_mask != 0
    }

    /// Drops the connection. The next operation reconnects lazily.
    pub fn disconnect(&mut self) {
        self.connection = None;
    }

    /// Connects and probes until a usable connection exists. The probe
    /// is a trivial cursor move near the origin; only once the server
    /// accepts it is the cursor position considered authoritative.
    ///
    /// Retries without bound — callers bring their own deadline.
    pub async fn connect(&mut self) {
        while self.connection.is_none() {
            match self.connector.connect().await {
                Ok(mut conn) => {
                    let probe = (2u16, self.geometry.toolbar_margin as u16 + 2);
                    match conn.pointer_event(0, probe.0, probe.1).await {
                        Ok(()) => {
                            self.cursor = Some(probe);
                            self.connection = Some(conn);
                        }
                        Err(e) => {
                            debug!("Readiness probe failed: {e}");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
                Err(e) => {
                    debug!("Connect attempt failed: {e}");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Captures frames until one passes the readiness heuristic or the
    /// deadline passes, reconnecting inline on any transport failure.
    /// On timeout the best (most recent) frame is returned; a blank
    /// frame only if nothing was ever captured. Without a timeout the
    /// call blocks until a ready frame appears.
    pub async fn get_screen(
        &mut self,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Frame {
        let start = Instant::now();
        let expired = |now: Instant| timeout.is_some_and(|t| now.duration_since(start) > t);
        let mut best: Option<Frame> = None;

        loop {
            self.connect().await;
            let (x, y, w, h) = self.capture_region();
            let attempt = match self.connection.as_mut() {
                Some(conn) => conn.capture(x, y, w, h).await,
                None => Err(TransportError::Disconnected),
            };

            match attempt {
                Ok(frame) => {
                    if frame.is_ready() {
                        return frame;
                    }
                    best = Some(frame);
                    if expired(Instant::now()) {
                        break;
                    }
                    tokio::time::sleep(poll_interval).await;
                }
                Err(e) => {
                    debug!("Capture failed ({e}), reconnecting");
                    self.connection = None;
                    if expired(Instant::now()) {
                        break;
                    }
                }
            }
        }

        best.unwrap_or_else(|| Frame::blank(self.geometry.width, self.geometry.height))
    }

    /// Moves the cursor by a delta from the last known position.
    pub async fn move_cursor_by(&mut self, dx: i32, dy: i32) -> Result<(), TransportError> {
        let (cx, cy) = self.cursor_or_origin();
        let content_y = i64::from(cy) - i64::from(self.geometry.toolbar_margin);
        self.move_to_clamped(i64::from(cx) + i64::from(dx), content_y + i64::from(dy))
            .await
    }

    /// Moves the cursor to an absolute content coordinate.
    pub async fn move_cursor_to(&mut self, x: i32, y: i32) -> Result<(), TransportError> {
        self.move_to_clamped(i64::from(x), i64::from(y)).await
    }

    async fn move_to_clamped(&mut self, x: i64, y: i64) -> Result<(), TransportError> {
        let target = self.clamp(x, y);
        let mask = self.held_mask;
        self.pointer(mask, target).await?;
        self.cursor = Some(target);
        Ok(())
    }

    /// Presses and releases a mouse button at the current position.
    pub async fn click(&mut self, button: u8) -> Result<(), TransportError> {
        let pos = self.cursor_or_origin();
        let held = self.held_mask;
        self.pointer(held | button_mask(button), pos).await?;
        self.pointer(held, pos).await
    }

    /// Presses and holds a mouse button.
    pub async fn hold_start(&mut self, button: u8) -> Result<(), TransportError> {
        let pos = self.cursor_or_origin();
        self.pointer(button_mask(button), pos).await?;
        self.held_mask = button_mask(button);
        Ok(())
    }

    /// Releases a held mouse button.
    pub async fn hold_end(&mut self, _button: u8) -> Result<(), TransportError> {
        let pos = self.cursor_or_origin();
        self.pointer(0, pos).await?;
        self.held_mask = 0;
        Ok(())
    }

    /// Presses a key.
    pub async fn key_down(&mut self, keysym: u32) -> Result<(), TransportError> {
        self.key(true, keysym).await
    }

    /// Releases a key.
    pub async fn key_up(&mut self, keysym: u32) -> Result<(), TransportError> {
        self.key(false, keysym).await
    }

    /// Presses and releases a key.
    pub async fn key_press(&mut self, keysym: u32) -> Result<(), TransportError> {
        self.key(true, keysym).await?;
        self.key(false, keysym).await
    }

    async fn pointer(&mut self, mask: u8, pos: (u16, u16)) -> Result<(), TransportError> {
        self.connect().await;
        let Some(conn) = self.connection.as_mut() else {
            return Err(TransportError::Disconnected);
        };
        match conn.pointer_event(mask, pos.0, pos.1).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Pointer event failed: {e}");
                self.connection = None;
                Err(e)
            }
        }
    }

    async fn key(&mut self, down: bool, keysym: u32) -> Result<(), TransportError> {
        self.connect().await;
        let Some(conn) = self.connection.as_mut() else {
            return Err(TransportError::Disconnected);
        };
        match conn.key_event(down, keysym).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Key event failed: {e}");
                self.connection = None;
                Err(e)
            }
        }
    }

    fn cursor_or_origin(&self) -> (u16, u16) {
        self.cursor
            .unwrap_or((2, self.geometry.toolbar_margin as u16 + 2))
    }

    fn clamp(&self, x: i64, y: i64) -> (u16, u16) {
        let cx = x.clamp(0, i64::from(self.geometry.width) - 1);
        let cy = y.clamp(0, i64::from(self.geometry.height) - 1)
            + i64::from(self.geometry.toolbar_margin);
        (cx as u16, cy as u16)
    }

    fn capture_region(&self) -> (u16, u16, u16, u16) {
        (
            0,
            self.geometry.toolbar_margin as u16,
            self.geometry.width as u16,
            self.geometry.height as u16,
        )
    }
}

fn button_mask(button: u8) -> u8 {
    1u8.checked_shl(u32::from(button.saturating_sub(1)))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn solid_frame(width: u32, height: u32, value: u8) -> Frame {
        Frame {
            width,
            height,
            data: vec![value; width as usize * height as usize * 3],
        }
    }

    /// Frame with `dark` of its pixels black and the rest white.
    fn mixed_frame(total: usize, dark: usize) -> Frame {
        let mut data = vec![255u8; total * 3];
        for px in 0..dark {
            data[px * 3..px * 3 + 3].copy_from_slice(&[0, 0, 0]);
        }
        Frame {
            width: total as u32,
            height: 1,
            data,
        }
    }

    #[test]
    fn test_dark_fraction_boundaries() {
        // 95% dark: still loading.
        assert!(!mixed_frame(100, 95).is_ready());
        // 85% dark: rendered enough.
        assert!(mixed_frame(100, 85).is_ready());
        // Exactly 90%: the boundary itself counts as ready.
        assert!(mixed_frame(100, 90).is_ready());
        assert!(!mixed_frame(1000, 901).is_ready());
    }

    #[test]
    fn test_luminance_threshold() {
        // (15, 15, 15) has luminance just under 16 → dark.
        assert!(!solid_frame(10, 10, 15).is_ready());
        // (17, 17, 17) is above the threshold → not dark at all.
        assert!((solid_frame(10, 10, 17).dark_fraction() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_blank_frame_is_not_ready() {
        assert!(!Frame::blank(8, 8).is_ready());
    }

    #[test]
    fn test_button_mask() {
        assert_eq!(button_mask(1), 0b001);
        assert_eq!(button_mask(2), 0b010);
        assert_eq!(button_mask(3), 0b100);
    }

    // -------------------------------------------------------------------------
    // Scripted transport for session-level tests
    // -------------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct Script {
        /// Outcomes for pointer events, in order; exhausted → success.
        pointer: Arc<Mutex<VecDeque<Result<(), ()>>>>,
        /// Frames served by capture, in order; exhausted → last again.
        frames: Arc<Mutex<VecDeque<Frame>>>,
        pointer_sent: Arc<AtomicUsize>,
        connects: Arc<AtomicUsize>,
    }

    struct ScriptedTransport(Script);

    #[async_trait]
    impl FramebufferTransport for ScriptedTransport {
        async fn pointer_event(
            &mut self,
            _mask: u8,
            _x: u16,
            _y: u16,
        ) -> Result<(), TransportError> {
            let outcome = self.0.pointer.lock().unwrap().pop_front().unwrap_or(Ok(()));
            match outcome {
                Ok(()) => {
                    self.0.pointer_sent.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Err(()) => Err(TransportError::Io(std::io::Error::from(
                    std::io::ErrorKind::BrokenPipe,
                ))),
            }
        }

        async fn key_event(&mut self, _down: bool, _keysym: u32) -> Result<(), TransportError> {
            Ok(())
        }

        async fn capture(
            &mut self,
            _x: u16,
            _y: u16,
            width: u16,
            height: u16,
        ) -> Result<Frame, TransportError> {
            let mut frames = self.0.frames.lock().unwrap();
            if frames.len() > 1 {
                Ok(frames.pop_front().expect("non-empty"))
            } else {
                frames
                    .front()
                    .cloned()
                    .ok_or(TransportError::Disconnected)
                    .or_else(|_| Ok(solid_frame(u32::from(width), u32::from(height), 255)))
            }
        }
    }

    #[async_trait]
    impl Connector for Script {
        async fn connect(&self) -> Result<Box<dyn FramebufferTransport>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedTransport(self.clone())))
        }
    }

    fn session(script: &Script) -> RemoteDesktopSession {
        RemoteDesktopSession::new(
            Box::new(script.clone()),
            Geometry {
                width: 100,
                height: 100,
                toolbar_margin: 10,
            },
        )
    }

    #[tokio::test]
    async fn test_transport_error_invalidates_then_next_call_reconnects() {
        let script = Script::default();
        // Probe succeeds, first real move fails, then everything works.
        script
            .pointer
            .lock()
            .unwrap()
            .extend([Ok(()), Err(()), Ok(()), Ok(())]);

        let mut session = session(&script);
        session.connect().await;
        assert!(session.is_connected());
        assert_eq!(script.connects.load(Ordering::SeqCst), 1);

        // The failing move invalidates the connection and reports the error.
        let err = session.move_cursor_to(50, 50).await;
        assert!(err.is_err());
        assert!(!session.is_connected());

        // The very next input call reconnects (probe) before resending.
        session.move_cursor_to(50, 50).await.unwrap();
        assert!(session.is_connected());
        assert_eq!(script.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cursor_updates_only_on_success() {
        let script = Script::default();
        script
            .pointer
            .lock()
            .unwrap()
            .extend([Ok(()), Err(()), Ok(()), Ok(())]);

        let mut session = session(&script);
        session.connect().await;
        let probed = session.cursor;
        assert_eq!(probed, Some((2, 12)));

        assert!(session.move_cursor_to(40, 40).await.is_err());
        assert_eq!(session.cursor, probed);

        // Reconnect probe lands at the origin again, then the move sticks.
        session.move_cursor_to(40, 40).await.unwrap();
        assert_eq!(session.cursor, Some((40, 50)));
    }

    #[tokio::test]
    async fn test_cursor_clamping() {
        let script = Script::default();
        let mut session = session(&script);

        session.move_cursor_to(5000, -20).await.unwrap();
        // x clamped to width-1, y clamped to 0 plus the margin.
        assert_eq!(session.cursor, Some((99, 10)));

        session.move_cursor_by(-10_000, 42).await.unwrap();
        assert_eq!(session.cursor, Some((0, 52)));
    }

    #[tokio::test]
    async fn test_hold_state_tracking() {
        let script = Script::default();
        let mut session = session(&script);

        assert!(!session.mouse_held());
        session.hold_start(1).await.unwrap();
        assert!(session.mouse_held());
        session.hold_end(1).await.unwrap();
        assert!(!session.mouse_held());
    }

    #[tokio::test]
    async fn test_get_screen_waits_for_ready_frame() {
        let script = Script::default();
        script.frames.lock().unwrap().extend([
            solid_frame(100, 100, 0),
            solid_frame(100, 100, 0),
            solid_frame(100, 100, 200),
        ]);

        let mut session = session(&script);
        let frame = session.get_screen(None, Duration::from_millis(1)).await;
        assert!(frame.is_ready());
        assert_eq!(frame.data[0], 200);
    }

    #[tokio::test]
    async fn test_get_screen_returns_best_frame_on_timeout() {
        let script = Script::default();
        script
            .frames
            .lock()
            .unwrap()
            .push_back(solid_frame(100, 100, 0));

        let mut session = session(&script);
        let frame = session
            .get_screen(Some(Duration::from_millis(50)), Duration::from_millis(5))
            .await;
        // Never became ready, but the caller still gets the last capture.
        assert!(!frame.is_ready());
        assert_eq!(frame.width, 100);
    }
}
