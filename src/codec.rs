//! A tokio codec for the HL7 MLLP network protocol, built on the [`Framer`] state machine.

use bytes::buf::BufMut;
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use tokio_util::codec::*;

use crate::mllp::{Framer, TerminatorPolicy, CARRIAGE_RETURN, END_BLOCK_BYTE, START_BLOCK_BYTE};

/// Decodes inbound frames into ASCII message text and wraps outbound payloads in MLLP framing.
#[derive(Debug, Default)]
pub struct MllpCodec {
    // Frames that arrive over several reads are stitched together inside the framer, not here.
    framer: Framer,
}

impl MllpCodec {
    const BLOCK_HEADER: u8 = START_BLOCK_BYTE; //Vertical-Tab char, the marker for the start of a message
    const BLOCK_FOOTER: [u8; 2] = [END_BLOCK_BYTE, CARRIAGE_RETURN]; //File-Separator char + CR, the marker for the end of a message

    /// Creates a new Codec instance, generally for use within a [Tokio Framed](https://docs.rs/tokio-util/0.7/tokio_util/codec/struct.Framed.html),
    /// but can be instantiated standalone for testing purposes etc.
    /// Example:
    /// ```
    /// use analyzer_logger::MllpCodec;
    /// let mllp = MllpCodec::new();
    /// ```
    pub fn new() -> Self {
        MllpCodec::default()
    }

    pub fn with_policy(policy: TerminatorPolicy) -> Self {
        MllpCodec {
            framer: Framer::with_policy(policy),
        }
    }

    /// Wraps `payload` in a start block, end block and trailing CR, appending to `dst`.
    pub fn frame_into(payload: &[u8], dst: &mut BytesMut) {
        dst.reserve(payload.len() + 3); //we need an extra 3 bytes of space on top of the message proper
        dst.put_u8(MllpCodec::BLOCK_HEADER); //header
        dst.put_slice(payload); //data
        dst.put_slice(&MllpCodec::BLOCK_FOOTER); //footer
    }

    /// Frames HL7 text for the wire. Characters outside ASCII are sent as `?`.
    pub fn frame_text(text: &str) -> Bytes {
        let mut dst = BytesMut::with_capacity(text.len() + 3);
        MllpCodec::frame_into(&ascii_bytes(text), &mut dst);
        dst.freeze()
    }
}

/// Encodes text as single-byte ASCII, substituting `?` for anything that doesn't fit.
pub fn ascii_bytes(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

// Support encoding data as an MLLP Frame.
// This is used for the ACK/NACK messages sent back to the analyzer, and by test publishers.
impl Encoder<BytesMut> for MllpCodec {
    type Error = std::io::Error;

    fn encode(&mut self, event: BytesMut, dst: &mut BytesMut) -> Result<(), Self::Error> {
        MllpCodec::frame_into(&event, dst);
        trace!("MLLP: Encoded value for send: '{:?}'", dst);
        Ok(())
    }
}

// Support decoding data from an MLLP Frame.
// Every byte handed to us is consumed, bytes that don't complete a frame are held by the framer.
impl Decoder for MllpCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.framer.decode(src))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let result = self.decode(buf)?;
        if result.is_none() && self.framer.has_partial_frame() {
            debug!("MLLP: Stream closed mid-frame, discarding partial message");
            self.framer.reset();
        }
        Ok(result)
    }
}
