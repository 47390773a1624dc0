//! The domain model extracted from one observation-result message.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Everything the engine keeps from one HL7 message. Built once per MLLP frame and never mutated.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ParsedObservationMessage {
    /// MSH-10, empty when the sender left it out.
    pub message_control_id: String,
    pub patient_id: Option<String>,
    pub order_number: Option<String>,
    /// MSH-7 in UTC, or the time of parsing when MSH-7 is missing or unreadable.
    pub message_date_time_utc: DateTime<Utc>,
    pub data_source_name: Option<String>,
    pub device_id: Option<String>,
    pub patient_sequence_number: Option<String>,
    /// Non-empty last, first and middle names joined with `^`.
    pub patient_name: Option<String>,
    pub patient_name_last: Option<String>,
    pub patient_name_first: Option<String>,
    pub patient_name_middle: Option<String>,
    pub patient_sex: Option<String>,
    /// Non-empty street, city, state and postal code joined with spaces.
    pub patient_address: Option<String>,
    pub patient_phone: Option<String>,
    pub patient_race: Option<String>,
    /// In the order the OBX segments appeared.
    pub observations: Vec<ObservationRecord>,
}

/// One result line (OBX segment).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ObservationRecord {
    pub observation_id: String,
    pub observation_text: Option<String>,
    pub observation_id_1: Option<String>,
    pub observation_id_2: Option<String>,
    pub observation_id_3: Option<String>,
    pub observation_id_4: Option<String>,
    /// Carried as sent; never parsed as a number.
    pub value: Option<String>,
    pub units: Option<String>,
    pub reference_range: Option<String>,
    pub abnormal_flags: Option<String>,
    pub observation_date_time_utc: Option<DateTime<Utc>>,
    pub result_sequence_number: Option<String>,
    pub result_status: Option<String>,
    pub result_operator_id: Option<String>,
}
