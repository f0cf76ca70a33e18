use log::debug;

use crate::device::types::{ProtocolMessage, StatusKind};

/**
 * Reassembles the device's newline-delimited text stream from arbitrarily
 * fragmented notification payloads. The trailing unterminated segment is kept
 * byte-for-byte until a later payload completes it. No I/O, no timers.
 */
#[derive(Debug, Default)]
pub struct FrameBuffer {
    partial: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        FrameBuffer { partial: Vec::new() }
    }

    /// Appends `bytes` and returns every completed line, in arrival order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let rest = self.partial.split_off(pos + 1);
            self.partial.pop(); // the line feed itself
            let line = std::mem::replace(&mut self.partial, rest);
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        lines
    }

    /// Drops any buffered partial line. Called when the link is torn down.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

/**
 * Parses one completed line into a typed message. Dispatch is on the
 * 2-character prefix; anything unrecognized yields `None` so that newer
 * firmware can add messages without breaking older apps.
 */
pub fn parse(line: &str) -> Option<ProtocolMessage> {
    if let Some(payload) = line.strip_prefix("R:") {
        return match payload.parse::<i32>() {
            Ok(raw) => Some(ProtocolMessage::Reading(raw)),
            Err(err) => {
                debug!("Discarding reading with non-numeric payload {:?}: {}", payload, err);
                None
            },
        };
    }

    if let Some(token) = line.strip_prefix("S:") {
        let kind = match token {
            "READY" => Some(StatusKind::Ready),
            "NOT_READY" => Some(StatusKind::NotReady),
            "PONG" => Some(StatusKind::Pong),
            "TARED" => Some(StatusKind::Tared),
            _ => match token.strip_prefix("RATE:") {
                Some(ms) => match ms.parse::<u32>() {
                    Ok(ms) => Some(StatusKind::RateConfirmed(ms)),
                    Err(err) => {
                        debug!("Discarding rate acknowledgement {:?}: {}", token, err);
                        None
                    },
                },
                None => {
                    debug!("Discarding unknown status token {:?}", token);
                    None
                },
            },
        };
        return kind.map(ProtocolMessage::Status);
    }

    if let Some(payload) = line.strip_prefix("D:") {
        return match payload.strip_prefix("GRIPFIT,") {
            Some(version) => Some(ProtocolMessage::DeviceInfo(version.to_string())),
            None => {
                debug!("Discarding device info line {:?}", payload);
                None
            },
        };
    }

    debug!("Discarding line with unrecognized prefix {:?}", line);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_lines_are_returned_in_order() {
        let mut buffer = FrameBuffer::new();
        let lines = buffer.push(b"R:100\nS:READY\nR:2");
        assert_eq!(lines, vec!["R:100".to_string(), "S:READY".to_string()]);
    }

    #[test]
    fn partial_line_is_preserved_across_pushes() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(b"R:123").is_empty());
        let lines = buffer.push(b"456\nR:789\n");
        assert_eq!(lines, vec!["R:123456".to_string(), "R:789".to_string()]);
        assert!(buffer.push(b"").is_empty());
        // buffer must be empty again: the next complete line arrives intact
        assert_eq!(buffer.push(b"S:PONG\n"), vec!["S:PONG".to_string()]);
    }

    #[test]
    fn chunking_does_not_change_the_extracted_messages() {
        let stream = b"R:1\nS:READY\nD:GRIPFIT,1.2.0\nR:-44\nS:RATE:100\n";

        let mut whole = FrameBuffer::new();
        let expected = whole.push(stream);

        for chunk_size in 1..stream.len() {
            let mut buffer = FrameBuffer::new();
            let mut lines = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                lines.extend(buffer.push(chunk));
            }
            assert_eq!(lines, expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn clear_discards_the_partial_line() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b"R:12");
        buffer.clear();
        assert_eq!(buffer.push(b"34\n"), vec!["34".to_string()]);
    }

    #[test]
    fn parse_readings() {
        assert_eq!(parse("R:834572"), Some(ProtocolMessage::Reading(834572)));
        assert_eq!(parse("R:-250"), Some(ProtocolMessage::Reading(-250)));
        assert_eq!(parse("R:abc"), None);
        assert_eq!(parse("R:"), None);
    }

    #[test]
    fn parse_status_tokens() {
        assert_eq!(parse("S:READY"), Some(ProtocolMessage::Status(StatusKind::Ready)));
        assert_eq!(parse("S:NOT_READY"), Some(ProtocolMessage::Status(StatusKind::NotReady)));
        assert_eq!(parse("S:PONG"), Some(ProtocolMessage::Status(StatusKind::Pong)));
        assert_eq!(parse("S:TARED"), Some(ProtocolMessage::Status(StatusKind::Tared)));
        assert_eq!(parse("S:RATE:100"), Some(ProtocolMessage::Status(StatusKind::RateConfirmed(100))));
        assert_eq!(parse("S:RATE:fast"), None);
        assert_eq!(parse("S:BUSY"), None);
    }

    #[test]
    fn parse_device_info() {
        assert_eq!(parse("D:GRIPFIT,1.0"), Some(ProtocolMessage::DeviceInfo("1.0".to_string())));
        assert_eq!(parse("D:GRIPFIT,2.1.3-beta"), Some(ProtocolMessage::DeviceInfo("2.1.3-beta".to_string())));
        assert_eq!(parse("D:OTHERDEVICE,1.0"), None);
    }

    #[test]
    fn parse_is_case_sensitive_and_forward_compatible() {
        assert_eq!(parse("garbage"), None);
        assert_eq!(parse(""), None);
        assert_eq!(parse("r:123"), None);
        assert_eq!(parse("s:ready"), None);
        assert_eq!(parse("X:FUTURE"), None);
    }
}
