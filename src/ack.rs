//! Builds the framed HL7 acknowledgment sent back for every message.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::codec::MllpCodec;
use crate::config::AckSettings;
use crate::hl7::{escape, Delimiters};

const ACK_MESSAGE_TYPE: &str = "ACK^A01";
const ACK_PROCESSING_ID: &str = "P";
const ACK_VERSION: &str = "2.5.1";
/// Control id written into MSH-10 and MSA-2 unless the builder echoes the inbound one.
pub const FIXED_CONTROL_ID: &str = "1";

/// Whether the message was accepted (`AA`) or rejected with an application error (`AE`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Accepted,
    Error(String),
}

impl AckOutcome {
    /// The MSA-1 acknowledgment code.
    pub fn code(&self) -> &'static str {
        match self {
            AckOutcome::Accepted => "AA",
            AckOutcome::Error(_) => "AE",
        }
    }
}

/// Identity fields written into the acknowledgment's MSH segment.
///
/// Analyzers in the field expect the constant control id `1` in every acknowledgment, so the
/// inbound MSH-10 is only echoed when `echo_control_id` is set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckBuilder {
    pub sending_application: String,
    pub sending_facility: String,
    pub receiving_application: String,
    pub receiving_facility: String,
    pub echo_control_id: bool,
}

impl Default for AckBuilder {
    fn default() -> Self {
        Self {
            sending_application: "LOGGER".to_owned(),
            sending_facility: "HOST".to_owned(),
            receiving_application: "DEVICE".to_owned(),
            receiving_facility: "FACILITY".to_owned(),
            echo_control_id: false,
        }
    }
}

impl From<&AckSettings> for AckBuilder {
    fn from(settings: &AckSettings) -> Self {
        Self {
            sending_application: settings.sending_application.clone(),
            sending_facility: settings.sending_facility.clone(),
            receiving_application: settings.receiving_application.clone(),
            receiving_facility: settings.receiving_facility.clone(),
            echo_control_id: settings.echo_control_id,
        }
    }
}

impl AckBuilder {
    /// The MLLP-framed acknowledgment for `control_id`, stamped with the current time.
    pub fn build(&self, control_id: &str, outcome: &AckOutcome) -> Bytes {
        MllpCodec::frame_text(&self.text(control_id, outcome, Utc::now()))
    }

    /// The unframed acknowledgment text: an MSH segment and an MSA segment, each CR-terminated.
    pub fn text(&self, control_id: &str, outcome: &AckOutcome, at: DateTime<Utc>) -> String {
        let delimiters = Delimiters::default();
        let field = |value: &str| escape(value, &delimiters);
        let control_id = if self.echo_control_id {
            field(control_id)
        } else {
            FIXED_CONTROL_ID.to_owned()
        };

        let header = [
            "MSH".to_owned(),
            delimiters.encoding_characters(),
            field(&self.sending_application),
            field(&self.sending_facility),
            field(&self.receiving_application),
            field(&self.receiving_facility),
            at.format("%Y%m%d%H%M%S").to_string(),
            String::new(),
            ACK_MESSAGE_TYPE.to_owned(),
            control_id.clone(),
            ACK_PROCESSING_ID.to_owned(),
            ACK_VERSION.to_owned(),
        ]
        .join("|");

        let mut acknowledgment = vec!["MSA".to_owned(), outcome.code().to_owned(), control_id];
        if let AckOutcome::Error(reason) = outcome {
            // keep the reason on one line so it can't end the segment early
            let reason: String = reason
                .chars()
                .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
                .collect();
            acknowledgment.push(field(&reason));
        }

        format!("{}\r{}\r", header, acknowledgment.join("|"))
    }
}
