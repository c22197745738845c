//! Minimal RFB (VNC) client: enough protocol to authenticate, inject
//! pointer/key events, and pull raw framebuffer updates.
//!
//! Supports protocol 3.3 and 3.8 handshakes, VNC challenge-response
//! authentication, a 32-bit true-colour pixel format, and the Raw
//! encoding only — the sandbox side runs a plain x11vnc, nothing fancier
//! is needed. Incremental updates are not used: every capture requests a
//! full refresh of the region of interest.

use std::time::Duration;

use async_trait::async_trait;
use des::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use des::Des;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{Frame, FramebufferTransport, TransportError};

/// How long one framebuffer update may take to arrive before the
/// connection is considered dead.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

// Client → server message ids.
const MSG_SET_PIXEL_FORMAT: u8 = 0;
const MSG_SET_ENCODINGS: u8 = 2;
const MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
const MSG_KEY_EVENT: u8 = 4;
const MSG_POINTER_EVENT: u8 = 5;

// Server → client message ids.
const MSG_FRAMEBUFFER_UPDATE: u8 = 0;
const MSG_SET_COLOUR_MAP: u8 = 1;
const MSG_BELL: u8 = 2;
const MSG_SERVER_CUT_TEXT: u8 = 3;

const ENCODING_RAW: i32 = 0;

const SECURITY_NONE: u8 = 1;
const SECURITY_VNC_AUTH: u8 = 2;

/// An authenticated RFB connection with a locally mirrored framebuffer.
pub(crate) struct RfbClient {
    stream: TcpStream,
    width: u16,
    height: u16,
    /// RGB, 3 bytes per pixel, `width * height` pixels.
    framebuffer: Vec<u8>,
}

impl RfbClient {
    /// Performs the full handshake against `addr` and leaves the
    /// connection ready for input and capture calls.
    pub async fn connect(
        addr: &str,
        password: &str,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;

        let mut client = Self {
            stream,
            width: 0,
            height: 0,
            framebuffer: Vec::new(),
        };
        tokio::time::timeout(READ_TIMEOUT, client.handshake(password))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(client)
    }

    async fn handshake(&mut self, password: &str) -> Result<(), TransportError> {
        // ProtocolVersion: "RFB xxx.yyy\n".
        let mut version = [0u8; 12];
        self.stream.read_exact(&mut version).await?;
        if &version[..4] != b"RFB " {
            return Err(TransportError::protocol("not an RFB server"));
        }
        let minor: u32 = std::str::from_utf8(&version[8..11])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransportError::protocol("unparseable protocol version"))?;

        let own_version: &[u8] = if minor >= 8 {
            b"RFB 003.008\n"
        } else {
            b"RFB 003.003\n"
        };
        self.stream.write_all(own_version).await?;

        let security = if minor >= 8 {
            self.negotiate_security_38().await?
        } else {
            self.negotiate_security_33().await?
        };

        if security == SECURITY_VNC_AUTH {
            self.vnc_auth(password).await?;
        }
        if security == SECURITY_VNC_AUTH || minor >= 8 {
            let result = self.stream.read_u32().await?;
            if result != 0 {
                // 3.8 attaches a reason string; surface it if present.
                let reason = self.read_reason().await.unwrap_or_default();
                return Err(TransportError::auth_failed(reason));
            }
        }

        // ClientInit: request a shared session.
        self.stream.write_all(&[1]).await?;

        // ServerInit: geometry, server pixel format (replaced below), name.
        self.width = self.stream.read_u16().await?;
        self.height = self.stream.read_u16().await?;
        let mut server_format = [0u8; 16];
        self.stream.read_exact(&mut server_format).await?;
        let name_len = self.stream.read_u32().await?;
        let mut name = vec![0u8; name_len as usize];
        self.stream.read_exact(&mut name).await?;
        debug!(
            "RFB session established: {}x{} \"{}\"",
            self.width,
            self.height,
            String::from_utf8_lossy(&name)
        );

        self.framebuffer = vec![0u8; self.width as usize * self.height as usize * 3];

        self.set_pixel_format().await?;
        self.set_encodings().await?;
        Ok(())
    }

    async fn negotiate_security_38(&mut self) -> Result<u8, TransportError> {
        let count = self.stream.read_u8().await?;
        if count == 0 {
            let reason = self.read_reason().await.unwrap_or_default();
            return Err(TransportError::protocol(format!(
                "server refused connection: {reason}"
            )));
        }
        let mut types = vec![0u8; count as usize];
        self.stream.read_exact(&mut types).await?;

        let chosen = if types.contains(&SECURITY_VNC_AUTH) {
            SECURITY_VNC_AUTH
        } else if types.contains(&SECURITY_NONE) {
            SECURITY_NONE
        } else {
            return Err(TransportError::protocol("no supported security type"));
        };
        self.stream.write_all(&[chosen]).await?;
        Ok(chosen)
    }

    async fn negotiate_security_33(&mut self) -> Result<u8, TransportError> {
        // 3.3: the server dictates the type as a single u32.
        let security = self.stream.read_u32().await?;
        match security {
            0 => {
                let reason = self.read_reason().await.unwrap_or_default();
                Err(TransportError::protocol(format!(
                    "server refused connection: {reason}"
                )))
            }
            1 => Ok(SECURITY_NONE),
            2 => Ok(SECURITY_VNC_AUTH),
            other => Err(TransportError::protocol(format!(
                "unsupported security type {other}"
            ))),
        }
    }

    async fn read_reason(&mut self) -> Result<String, TransportError> {
        let len = self.stream.read_u32().await?;
        let mut reason = vec![0u8; (len as usize).min(1024)];
        self.stream.read_exact(&mut reason).await?;
        Ok(String::from_utf8_lossy(&reason).into_owned())
    }

    async fn vnc_auth(&mut self, password: &str) -> Result<(), TransportError> {
        let mut challenge = [0u8; 16];
        self.stream.read_exact(&mut challenge).await?;

        let response = encrypt_challenge(password, &challenge);
        self.stream.write_all(&response).await?;
        Ok(())
    }

    async fn set_pixel_format(&mut self) -> Result<(), TransportError> {
        // 32 bpp, depth 24, little-endian, true colour, 8 bits per
        // channel, red at bit 16 / green at 8 / blue at 0.
        let mut msg = [0u8; 20];
        msg[0] = MSG_SET_PIXEL_FORMAT;
        msg[4] = 32; // bits per pixel
        msg[5] = 24; // depth
        msg[6] = 0; // big-endian flag
        msg[7] = 1; // true-colour flag
        msg[8..10].copy_from_slice(&255u16.to_be_bytes()); // red max
        msg[10..12].copy_from_slice(&255u16.to_be_bytes()); // green max
        msg[12..14].copy_from_slice(&255u16.to_be_bytes()); // blue max
        msg[14] = 16; // red shift
        msg[15] = 8; // green shift
        msg[16] = 0; // blue shift
        self.stream.write_all(&msg).await?;
        Ok(())
    }

    async fn set_encodings(&mut self) -> Result<(), TransportError> {
        let mut msg = Vec::with_capacity(8);
        msg.push(MSG_SET_ENCODINGS);
        msg.push(0); // padding
        msg.extend_from_slice(&1u16.to_be_bytes()); // one encoding
        msg.extend_from_slice(&ENCODING_RAW.to_be_bytes());
        self.stream.write_all(&msg).await?;
        Ok(())
    }

    async fn request_update(
        &mut self,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    ) -> Result<(), TransportError> {
        let mut msg = [0u8; 10];
        msg[0] = MSG_FRAMEBUFFER_UPDATE_REQUEST;
        msg[1] = 0; // full refresh, not incremental
        msg[2..4].copy_from_slice(&x.to_be_bytes());
        msg[4..6].copy_from_slice(&y.to_be_bytes());
        msg[6..8].copy_from_slice(&width.to_be_bytes());
        msg[8..10].copy_from_slice(&height.to_be_bytes());
        self.stream.write_all(&msg).await?;
        Ok(())
    }

    /// Reads server messages until one framebuffer update has been
    /// applied to the local mirror.
    async fn read_until_update(&mut self) -> Result<(), TransportError> {
        loop {
            let msg_type = self.stream.read_u8().await?;
            match msg_type {
                MSG_FRAMEBUFFER_UPDATE => {
                    let _padding = self.stream.read_u8().await?;
                    let rects = self.stream.read_u16().await?;
                    for _ in 0..rects {
                        self.read_rectangle().await?;
                    }
                    return Ok(());
                }
                MSG_SET_COLOUR_MAP => {
                    let _padding = self.stream.read_u8().await?;
                    let _first = self.stream.read_u16().await?;
                    let count = self.stream.read_u16().await?;
                    let mut skip = vec![0u8; count as usize * 6];
                    self.stream.read_exact(&mut skip).await?;
                }
                MSG_BELL => {}
                MSG_SERVER_CUT_TEXT => {
                    let mut padding = [0u8; 3];
                    self.stream.read_exact(&mut padding).await?;
                    let len = self.stream.read_u32().await?;
                    let mut skip = vec![0u8; len as usize];
                    self.stream.read_exact(&mut skip).await?;
                }
                other => {
                    return Err(TransportError::protocol(format!(
                        "unexpected server message {other}"
                    )));
                }
            }
        }
    }

    async fn read_rectangle(&mut self) -> Result<(), TransportError> {
        let x = self.stream.read_u16().await?;
        let y = self.stream.read_u16().await?;
        let w = self.stream.read_u16().await?;
        let h = self.stream.read_u16().await?;
        let encoding = self.stream.read_i32().await?;
        if encoding != ENCODING_RAW {
            return Err(TransportError::protocol(format!(
                "server sent unrequested encoding {encoding}"
            )));
        }

        let mut row = vec![0u8; w as usize * 4];
        for dy in 0..h {
            self.stream.read_exact(&mut row).await?;
            let fy = y as usize + dy as usize;
            if fy >= self.height as usize {
                continue;
            }
            for dx in 0..w as usize {
                let fx = x as usize + dx;
                if fx >= self.width as usize {
                    continue;
                }
                // Little-endian 32-bit pixel: b, g, r, pad.
                let src = dx * 4;
                let dst = (fy * self.width as usize + fx) * 3;
                self.framebuffer[dst] = row[src + 2];
                self.framebuffer[dst + 1] = row[src + 1];
                self.framebuffer[dst + 2] = row[src];
            }
        }
        trace!("Applied raw rect {}x{} at ({}, {})", w, h, x, y);
        Ok(())
    }

    /// Copies the requested region out of the local mirror, clamped to
    /// the server geometry.
    fn extract(&self, x: u16, y: u16, width: u16, height: u16) -> Frame {
        let mut data = vec![0u8; width as usize * height as usize * 3];
        for dy in 0..height as usize {
            let fy = y as usize + dy;
            if fy >= self.height as usize {
                break;
            }
            for dx in 0..width as usize {
                let fx = x as usize + dx;
                if fx >= self.width as usize {
                    break;
                }
                let src = (fy * self.width as usize + fx) * 3;
                let dst = (dy * width as usize + dx) * 3;
                data[dst..dst + 3].copy_from_slice(&self.framebuffer[src..src + 3]);
            }
        }
        Frame {
            width: width as u32,
            height: height as u32,
            data,
        }
    }
}

#[async_trait]
impl FramebufferTransport for RfbClient {
    async fn pointer_event(
        &mut self,
        button_mask: u8,
        x: u16,
        y: u16,
    ) -> Result<(), TransportError> {
        let mut msg = [0u8; 6];
        msg[0] = MSG_POINTER_EVENT;
        msg[1] = button_mask;
        msg[2..4].copy_from_slice(&x.to_be_bytes());
        msg[4..6].copy_from_slice(&y.to_be_bytes());
        self.stream.write_all(&msg).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn key_event(&mut self, down: bool, keysym: u32) -> Result<(), TransportError> {
        let mut msg = [0u8; 8];
        msg[0] = MSG_KEY_EVENT;
        msg[1] = u8::from(down);
        msg[4..8].copy_from_slice(&keysym.to_be_bytes());
        self.stream.write_all(&msg).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn capture(
        &mut self,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
    ) -> Result<Frame, TransportError> {
        self.request_update(x, y, width, height).await?;
        tokio::time::timeout(READ_TIMEOUT, self.read_until_update())
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(self.extract(x, y, width, height))
    }
}

/// VNC authentication: DES-encrypt the 16-byte challenge with the
/// password as key. Per the protocol, each key byte has its bit order
/// reversed, and the password is truncated or zero-padded to 8 bytes.
fn encrypt_challenge(password: &str, challenge: &[u8; 16]) -> [u8; 16] {
    let mut key = [0u8; 8];
    for (i, byte) in password.bytes().take(8).enumerate() {
        key[i] = byte.reverse_bits();
    }

    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut response = [0u8; 16];
    for (src, dst) in challenge.chunks_exact(8).zip(response.chunks_exact_mut(8)) {
        let mut block = GenericArray::clone_from_slice(src);
        cipher.encrypt_block(&mut block);
        dst.copy_from_slice(&block);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_password_uses_zero_key() {
        let challenge = [0u8; 16];
        // DES with an all-zero key and all-zero plaintext has a fixed,
        // non-zero ciphertext; both 8-byte halves come out identical.
        let response = encrypt_challenge("", &challenge);
        assert_eq!(response[..8], response[8..]);
        assert_ne!(response[..8], [0u8; 8]);
    }

    #[test]
    fn test_challenge_response_is_deterministic() {
        let challenge = [7u8; 16];
        assert_eq!(
            encrypt_challenge("12345", &challenge),
            encrypt_challenge("12345", &challenge)
        );
        assert_ne!(
            encrypt_challenge("12345", &challenge),
            encrypt_challenge("54321", &challenge)
        );
    }

    #[test]
    fn test_password_longer_than_key_is_truncated() {
        let challenge = [3u8; 16];
        assert_eq!(
            encrypt_challenge("longpassword", &challenge),
            encrypt_challenge("longpass", &challenge)
        );
    }

    #[tokio::test]
    async fn test_extract_clamps_to_geometry() {
        let client = RfbClientFixture::new(4, 4);
        let frame = client.0.extract(2, 2, 4, 4);
        assert_eq!(frame.width, 4);
        assert_eq!(frame.height, 4);
        // In-bounds corner carries the mirror value, the rest is zero.
        assert_eq!(frame.data[0], 0xAA);
        assert_eq!(frame.data[frame.data.len() - 1], 0);
    }

    /// Builds a client around a throwaway socket just to exercise the
    /// framebuffer bookkeeping.
    struct RfbClientFixture(RfbClient);

    impl RfbClientFixture {
        fn new(width: u16, height: u16) -> Self {
            let std_stream = std::net::TcpStream::connect(fixture_listener()).unwrap();
            std_stream.set_nonblocking(true).unwrap();
            let stream = TcpStream::from_std(std_stream).unwrap();
            Self(RfbClient {
                stream,
                width,
                height,
                framebuffer: vec![0xAA; width as usize * height as usize * 3],
            })
        }
    }

    fn fixture_listener() -> std::net::SocketAddr {
        static LISTENER: std::sync::OnceLock<std::net::SocketAddr> = std::sync::OnceLock::new();
        *LISTENER.get_or_init(|| {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    drop(stream);
                }
            });
            addr
        })
    }
}
