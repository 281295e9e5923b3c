//! DTLS ClientHello sniffing
//!
//! The supervisor never terminates DTLS itself, but it must route each
//! incoming datagram to the worker that owns the session. Modern clients
//! carry a stable session identifier in a private TLS extension so the
//! mapping survives NAT rebinding; legacy clients are matched through the
//! plain SessionID field of the ClientHello.
//!
//! Nothing here decrypts anything, and no byte is read without a prior
//! length check.

/// Offset of the handshake payload inside a DTLS record.
pub const RECORD_PAYLOAD_POS: usize = 13;

/// Offset of the SessionID length byte inside the ClientHello body.
pub const HANDSHAKE_SESSION_ID_POS: usize = 46;

/// Maximum size of a legacy TLS SessionID.
pub const MAX_SESSION_ID: usize = 32;

/// Private extension carrying the application session identifier.
///
/// ```text
/// Extension ID: 48018
/// opaque ApplicationID<1..2^8-1>;
/// ```
const TLS_EXT_APP_ID: u16 = 48018;

/// Minimum datagram size that can carry a sniffable ClientHello:
/// record header, hello preamble, SessionID field, extension length.
const MIN_HELLO_SIZE: usize = RECORD_PAYLOAD_POS + HANDSHAKE_SESSION_ID_POS + MAX_SESSION_ID + 2;

/// Bounds-checked walker over the ClientHello body.
struct View<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> View<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    /// Skip an `opaque v<0..2^8-1>` vector.
    fn skip_vec8(&mut self) -> Option<()> {
        let len = *self.buf.get(self.pos)? as usize;
        self.pos = self.pos.checked_add(1 + len)?;
        if self.pos > self.buf.len() {
            return None;
        }
        Some(())
    }

    /// Skip an `opaque v<0..2^16-1>` vector.
    fn skip_vec16(&mut self) -> Option<()> {
        let len = self.read_u16()? as usize;
        self.pos = self.pos.checked_add(len)?;
        if self.pos > self.buf.len() {
            return None;
        }
        Some(())
    }

    fn read_u16(&mut self) -> Option<u16> {
        let hi = *self.buf.get(self.pos)?;
        let lo = *self.buf.get(self.pos + 1)?;
        self.pos += 2;
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

/// Extract the session identifier from an unauthenticated ClientHello.
///
/// When `app_id_enabled` is set the deployment advertises the private
/// ApplicationID extension; the extension vector is walked first and the
/// legacy SessionID is only a fallback. When it is not set, the legacy
/// field is used directly.
///
/// Returns `None` when the datagram is too short to carry a ClientHello,
/// or when the ApplicationID extension itself is malformed. Any returned
/// slice lies entirely within `buf`.
pub fn extract_session_id(buf: &[u8], app_id_enabled: bool) -> Option<&[u8]> {
    if buf.len() < MIN_HELLO_SIZE {
        return None;
    }

    if app_id_enabled {
        if let Walk::Found(id) = walk_extensions(buf) {
            return id;
        }
    }

    legacy_session_id(buf)
}

enum Walk<'a> {
    /// ApplicationID extension located; `None` means it was malformed.
    Found(Option<&'a [u8]>),
    /// Bounds failure or no ApplicationID extension present.
    Fallback,
}

fn walk_extensions(buf: &[u8]) -> Walk<'_> {
    let mut v = View::new(buf, RECORD_PAYLOAD_POS + HANDSHAKE_SESSION_ID_POS);

    // SessionID, Cookie, CipherSuites, CompressionMethods
    if v.skip_vec8().is_none()
        || v.skip_vec8().is_none()
        || v.skip_vec16().is_none()
        || v.skip_vec8().is_none()
    {
        return Walk::Fallback;
    }

    // total extension vector length; the walk below is bounded by the
    // datagram itself, which is what the record actually delivered
    if v.read_u16().is_none() {
        return Walk::Fallback;
    }

    while v.remaining() > 0 {
        if v.remaining() < 4 {
            return Walk::Fallback;
        }
        let ext_type = match v.read_u16() {
            Some(t) => t,
            None => return Walk::Fallback,
        };

        if ext_type != TLS_EXT_APP_ID {
            if v.skip_vec16().is_none() {
                return Walk::Fallback;
            }
            continue;
        }

        // ApplicationID: length(2) || id_len(1) || id[id_len]
        let ext_len = match v.read_u16() {
            Some(l) => l as usize,
            None => return Walk::Found(None),
        };
        if v.remaining() < ext_len {
            return Walk::Found(None);
        }
        let id_len = match v.read_u8() {
            Some(l) => l as usize,
            None => return Walk::Found(None),
        };
        return Walk::Found(v.take(id_len));
    }

    Walk::Fallback
}

/// Legacy SessionID at its fixed ClientHello offset.
fn legacy_session_id(buf: &[u8]) -> Option<&[u8]> {
    let pos = RECORD_PAYLOAD_POS + HANDSHAKE_SESSION_ID_POS;
    let len = *buf.get(pos)? as usize;
    if len > MAX_SESSION_ID {
        return None;
    }
    buf.get(pos + 1..pos + 1 + len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    /// Build a DTLS ClientHello datagram with the given legacy SessionID
    /// and, when present, a trailing 48018 extension carrying `app_id`.
    fn client_hello(session_id: &[u8], app_id: Option<&[u8]>) -> Vec<u8> {
        let mut out = Vec::new();

        // DTLS record header: type 22, version 1.2, epoch, seq, length
        out.push(22);
        out.extend_from_slice(&[0xfe, 0xfd]);
        out.extend_from_slice(&[0, 0]); // epoch
        out.extend_from_slice(&[0, 0, 0, 0, 0, 1]); // sequence
        out.extend_from_slice(&[0, 0]); // record length (unused by sniffer)
        assert_eq!(out.len(), RECORD_PAYLOAD_POS);

        // Handshake preamble: msg type, length, message_seq,
        // fragment offset/length, client_version, random
        out.push(1);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(&[0xfe, 0xfd]);
        out.extend_from_slice(&[0xaa; 32]);
        assert_eq!(out.len(), RECORD_PAYLOAD_POS + HANDSHAKE_SESSION_ID_POS);

        // SessionID
        out.push(session_id.len() as u8);
        out.extend_from_slice(session_id);

        // Cookie, CipherSuites (a realistic-length list), CompressionMethods
        out.push(0);
        out.extend_from_slice(&[0, 32]);
        for suite in 0u16..16 {
            out.extend_from_slice(&suite.to_be_bytes());
        }
        out.extend_from_slice(&[1, 0]);

        // Extensions
        let mut exts = Vec::new();
        // an unrelated extension first (supported_groups)
        exts.extend_from_slice(&[0x00, 0x0a, 0x00, 0x02, 0x00, 0x1d]);
        if let Some(id) = app_id {
            exts.extend_from_slice(&TLS_EXT_APP_ID.to_be_bytes());
            exts.extend_from_slice(&((id.len() + 1) as u16).to_be_bytes());
            exts.push(id.len() as u8);
            exts.extend_from_slice(id);
        }
        out.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        out.extend_from_slice(&exts);

        out
    }

    #[test]
    fn test_app_id_extension_extracted() {
        let sid = [0x42u8; 32];
        let packet = client_hello(&sid, Some(b"abcd"));
        let id = extract_session_id(&packet, true).unwrap();
        assert_eq!(id, b"abcd");
    }

    #[test]
    fn test_stripped_extension_falls_back_to_session_id() {
        let sid = [0x42u8; 32];
        let packet = client_hello(&sid, None);
        let id = extract_session_id(&packet, true).unwrap();
        assert_eq!(id, &sid[..]);
    }

    #[test]
    fn test_app_id_disabled_uses_session_id() {
        let sid = [0x17u8; 32];
        let packet = client_hello(&sid, Some(b"abcd"));
        let id = extract_session_id(&packet, false).unwrap();
        assert_eq!(id, &sid[..]);
    }

    #[test]
    fn test_short_datagram_rejected() {
        let packet = client_hello(&[0x42; 32], Some(b"abcd"));
        assert!(extract_session_id(&packet[..MIN_HELLO_SIZE - 1], true).is_none());
        assert!(extract_session_id(&[], true).is_none());
    }

    #[test]
    fn test_overlong_extension_body_rejected() {
        let sid = [0x42u8; 32];
        let mut packet = client_hello(&sid, Some(b"abcd"));
        // the ApplicationID extension tail is: len(2) || id_len(1) || id(4);
        // declare a body length far past the end of the datagram
        let ext_len_pos = packet.len() - 7;
        packet[ext_len_pos] = 0xff;
        packet[ext_len_pos + 1] = 0xff;
        assert!(extract_session_id(&packet, true).is_none());
    }

    #[test]
    fn test_truncated_extension_walk_falls_back() {
        let sid = [0x37u8; 32];
        let mut packet = client_hello(&sid, None);
        // truncate in the middle of the unrelated extension body
        packet.truncate(packet.len() - 1);
        let id = extract_session_id(&packet, true).unwrap();
        assert_eq!(id, &sid[..]);
    }

    #[test]
    fn test_short_legacy_session_id() {
        let packet = client_hello(b"abcd", None);
        let id = extract_session_id(&packet, true).unwrap();
        assert_eq!(id, b"abcd");
    }

    #[test]
    fn test_random_input_never_panics_or_escapes() {
        let mut rng = rand::thread_rng();
        for len in [0usize, 12, 13, 92, 93, 128, 512, 1500] {
            for _ in 0..200 {
                let mut buf = vec![0u8; len];
                rng.fill_bytes(&mut buf);
                for enabled in [false, true] {
                    if let Some(id) = extract_session_id(&buf, enabled) {
                        // the slice must point inside the input
                        let base = buf.as_ptr() as usize;
                        let p = id.as_ptr() as usize;
                        assert!(p >= base && p + id.len() <= base + buf.len());
                        assert!(id.len() <= u8::MAX as usize);
                    }
                }
            }
        }
    }
}
