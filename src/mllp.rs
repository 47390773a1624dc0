//! This provides all the *non-network* logic around receiving and parsing the MLLP stream.
//! It knows nothing about sockets: bytes go in as they arrive, complete message payloads come out.
//! MLLP Spec: https://www.hl7.org/implement/standards/product_brief.cfm?product_id=55

use bytes::{Buf, BytesMut};
use log::{debug, trace};
use serde::Deserialize;

pub const START_BLOCK_BYTE: u8 = 0x0B; //Vertical-Tab char, the marker for the start of a message
pub const END_BLOCK_BYTE: u8 = 0x1C; //File-Separator char, the marker for the end of a message
pub const CARRIAGE_RETURN: u8 = 0x0D; // CR, ASCII 13

/// What the framer does with CR bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatorPolicy {
    /// Drop every CR wherever it appears, including segment separators inside a frame.
    /// The HL7 parser rebuilds segment boundaries for payloads framed this way.
    #[default]
    StripAll,
    /// Keep CRs received inside a frame, only drop those outside one (i.e. the CR trailing the end block).
    StripOutsideFrame,
}

/// The state of our state machine
#[derive(Clone, Copy, Debug, PartialEq)]
enum ParseState {
    /// No start block since the last end block. We're tolerant, so data still accumulates here.
    OutsideFrame,
    /// A start block was seen, everything up to the end block is message data
    InsideFrame,
}

/// Stateful MLLP decoder.
///
/// State (the accumulator and the inside/outside flag) survives between calls to [`Framer::decode`],
/// so frames split across any number of TCP reads are reassembled correctly.
#[derive(Debug)]
pub struct Framer {
    state: ParseState,
    current_message: BytesMut,
    policy: TerminatorPolicy,
}

impl Default for Framer {
    fn default() -> Self {
        Framer::with_policy(TerminatorPolicy::default())
    }
}

impl Framer {
    /// Constructs a new Framer ready for processing a stream of data
    pub fn new() -> Framer {
        Framer::default()
    }

    pub fn with_policy(policy: TerminatorPolicy) -> Framer {
        Framer {
            state: ParseState::OutsideFrame,
            current_message: BytesMut::with_capacity(1024),
            policy,
        }
    }

    /// True if bytes have been accumulated that haven't been closed by an end block yet.
    pub fn has_partial_frame(&self) -> bool {
        !self.current_message.is_empty()
    }

    /// Drops any partially accumulated frame. The buffer's allocation is kept for reuse.
    pub fn reset(&mut self) {
        self.current_message.clear();
        self.state = ParseState::OutsideFrame;
    }

    /// Consumes bytes from `src` up to and including the next end block, plus the CR right after it
    /// when that is present.
    ///
    /// Returns the completed payload if one was closed, leaving any following bytes in `src` for the
    /// next call. Returns `None` once `src` is exhausted without completing a frame; everything consumed
    /// so far is retained internally.
    pub fn decode(&mut self, src: &mut BytesMut) -> Option<String> {
        while !src.is_empty() {
            // copy runs of plain data in one go rather than byte by byte
            let run = src
                .iter()
                .position(|b| matches!(*b, START_BLOCK_BYTE | END_BLOCK_BYTE | CARRIAGE_RETURN))
                .unwrap_or(src.len());

            if run > 0 {
                self.current_message.extend_from_slice(&src[..run]);
                src.advance(run);
                continue;
            }

            let marker = src[0];
            src.advance(1);

            match marker {
                START_BLOCK_BYTE => {
                    if !self.current_message.is_empty() {
                        debug!(
                            "MLLP: Discarding {} bytes of unterminated data at start block",
                            self.current_message.len()
                        );
                    }
                    self.current_message.clear();
                    self.state = ParseState::InsideFrame;
                }
                END_BLOCK_BYTE => {
                    if self.state == ParseState::OutsideFrame {
                        trace!("MLLP: End block without a preceding start block");
                    }
                    self.state = ParseState::OutsideFrame;
                    // the CR closing the frame goes with it when it's already here
                    if src.first() == Some(&CARRIAGE_RETURN) {
                        src.advance(1);
                    }
                    return Some(self.take_message());
                }
                _ => {
                    // CR
                    if self.policy == TerminatorPolicy::StripOutsideFrame
                        && self.state == ParseState::InsideFrame
                    {
                        self.current_message.extend_from_slice(&[CARRIAGE_RETURN]);
                    }
                }
            }
        }

        None
    }

    fn take_message(&mut self) -> String {
        let message = ascii_text(&self.current_message);
        trace!("MLLP: Completed message of {} bytes", message.len());
        self.current_message.clear(); // keeps the capacity for the next frame
        message
    }
}

/// Decodes single-byte ASCII text, substituting `?` for anything outside the ASCII range.
pub fn ascii_text(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| if b.is_ascii() { *b as char } else { '?' })
        .collect()
}
