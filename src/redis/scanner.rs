/// Streaming reply framing detection
///
/// The session forwards backend bytes to the client as soon as they arrive,
/// so it never holds a whole reply in order to parse it. Instead every chunk
/// is pushed through [`scan`], which carries a small [`ReplyProgress`] across
/// reads. When the progress reports [`ReplyProgress::is_complete`] after a
/// chunk, exactly one top-level reply has been received in full.
///
/// Accounting: a type byte seen while nothing is outstanding opens one unit
/// for a new top-level value. An array header replaces its own unit with its
/// element count. Simple strings, errors, integers, null bulk strings, null or
/// empty arrays and bulk payloads (once their trailing terminator is read)
/// each close one unit. Bulk payloads are skipped by length, so payload bytes
/// are never interpreted as protocol syntax even across reads.

use crate::redis::resp::RespParseError;

/// Progress through the reply currently in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyProgress {
    outstanding: u64,
    state: ScanState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ScanState {
    /// Expecting the type byte of the next value
    #[default]
    TypeByte,
    /// Inside a `+`, `-` or `:` line
    Line { cr: bool },
    /// Inside the length header of a `$` or `*` value
    Length {
        kind: LengthKind,
        value: u64,
        negative: bool,
        digits: bool,
        cr: bool,
    },
    /// Skipping bulk payload bytes
    Payload { remaining: u64 },
    /// Expecting the terminator after a bulk payload
    Trailer { cr: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LengthKind {
    Bulk,
    Array,
}

impl ReplyProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of values still owed for the reply in flight
    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    /// True when no reply is in flight (everything scanned so far was complete)
    pub fn is_complete(&self) -> bool {
        self.outstanding == 0 && self.state == ScanState::TypeByte
    }

    fn close_unit(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.state = ScanState::TypeByte;
    }

    /// Advance over `chunk`. With `stop_when_complete` set, stops right after
    /// the first top-level value completes and returns the bytes consumed.
    fn advance(
        mut self,
        chunk: &[u8],
        stop_when_complete: bool,
    ) -> Result<(Self, Option<usize>), RespParseError> {
        let mut i = 0;

        while i < chunk.len() {
            if let ScanState::Payload { remaining } = self.state {
                let available = (chunk.len() - i) as u64;
                let skip = remaining.min(available);
                i += skip as usize;
                self.state = if skip == remaining {
                    ScanState::Trailer { cr: false }
                } else {
                    ScanState::Payload {
                        remaining: remaining - skip,
                    }
                };
                continue;
            }

            let byte = chunk[i];
            i += 1;
            self.step(byte)?;

            if stop_when_complete && self.is_complete() {
                return Ok((self, Some(i)));
            }
        }

        Ok((self, None))
    }

    fn step(&mut self, byte: u8) -> Result<(), RespParseError> {
        match self.state {
            ScanState::TypeByte => {
                if self.outstanding == 0 {
                    self.outstanding = 1;
                }
                self.state = match byte {
                    b'+' | b'-' | b':' => ScanState::Line { cr: false },
                    b'$' => Self::length(LengthKind::Bulk),
                    b'*' => Self::length(LengthKind::Array),
                    other => return Err(RespParseError::UnknownType(other)),
                };
            }
            ScanState::Line { cr } => match (cr, byte) {
                (true, b'\n') => self.close_unit(),
                (true, _) => {
                    return Err(RespParseError::InvalidFormat(
                        "carriage return not followed by line feed".to_string(),
                    ))
                }
                (false, b'\r') => self.state = ScanState::Line { cr: true },
                (false, _) => {}
            },
            ScanState::Length {
                kind,
                value,
                negative,
                digits,
                cr,
            } => {
                if cr {
                    if byte != b'\n' {
                        return Err(RespParseError::InvalidLength(
                            "length not terminated by CRLF".to_string(),
                        ));
                    }
                    self.finish_length(kind, value, negative);
                    return Ok(());
                }
                match byte {
                    b'\r' if digits => {
                        self.state = ScanState::Length {
                            kind,
                            value,
                            negative,
                            digits,
                            cr: true,
                        }
                    }
                    b'-' if !digits && !negative => {
                        self.state = ScanState::Length {
                            kind,
                            value,
                            negative: true,
                            digits,
                            cr,
                        }
                    }
                    b'0'..=b'9' => {
                        let value = value
                            .checked_mul(10)
                            .and_then(|v| v.checked_add(u64::from(byte - b'0')))
                            .ok_or_else(|| {
                                RespParseError::InvalidLength("length overflow".to_string())
                            })?;
                        self.state = ScanState::Length {
                            kind,
                            value,
                            negative,
                            digits: true,
                            cr,
                        }
                    }
                    other => {
                        return Err(RespParseError::InvalidLength(format!(
                            "unexpected byte 0x{other:02x} in length"
                        )))
                    }
                }
            }
            ScanState::Trailer { cr } => match (cr, byte) {
                (false, b'\r') => self.state = ScanState::Trailer { cr: true },
                (true, b'\n') => self.close_unit(),
                _ => {
                    return Err(RespParseError::InvalidFormat(
                        "bulk payload not terminated by CRLF".to_string(),
                    ))
                }
            },
            // Handled in bulk by `advance`
            ScanState::Payload { .. } => {}
        }
        Ok(())
    }

    fn length(kind: LengthKind) -> ScanState {
        ScanState::Length {
            kind,
            value: 0,
            negative: false,
            digits: false,
            cr: false,
        }
    }

    fn finish_length(&mut self, kind: LengthKind, value: u64, negative: bool) {
        match kind {
            LengthKind::Bulk if negative => self.close_unit(),
            LengthKind::Bulk => {
                self.state = ScanState::Payload { remaining: value };
            }
            LengthKind::Array if negative || value == 0 => self.close_unit(),
            LengthKind::Array => {
                self.outstanding = self.outstanding.saturating_sub(1).saturating_add(value);
                self.state = ScanState::TypeByte;
            }
        }
    }
}

/// Feed one chunk of backend bytes through the framing scanner.
///
/// The returned progress must be passed to the next call for the same
/// connection; it is not reset between reads.
pub fn scan(progress: ReplyProgress, chunk: &[u8]) -> Result<ReplyProgress, RespParseError> {
    progress.advance(chunk, false).map(|(progress, _)| progress)
}

/// Length of the first complete RESP value at the front of `buf`, if any
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, RespParseError> {
    ReplyProgress::new()
        .advance(buf, true)
        .map(|(_, consumed)| consumed)
}
