//! Turns one HL7 `ORU^R01` payload into a [`ParsedObservationMessage`].
//!
//! The observation-result grammar nests repeating groups:
//!
//! ```text
//! PATIENT_RESULT*  -> PID, ORDER_OBSERVATION*
//! ORDER_OBSERVATION -> [ORC], OBR, OBX*
//! ```
//!
//! Groups are rebuilt as plain nested vectors and then walked once. Patient and order fields keep
//! the first non-empty value seen; later groups never overwrite it.

use log::debug;

use crate::error::ParseError;
use crate::hl7::{Message, Segment};
use crate::model::{ObservationRecord, ParsedObservationMessage};
use crate::timestamp;

const OBSERVATION_RESULT_TYPE: &str = "ORU";

#[derive(Default)]
struct PatientResult<'a> {
    patient: Option<&'a Segment>,
    orders: Vec<OrderObservation<'a>>,
}

#[derive(Default)]
struct OrderObservation<'a> {
    common_order: Option<&'a Segment>,
    request: Option<&'a Segment>,
    observations: Vec<&'a Segment>,
}

/// Stateless; one instance can be shared by every connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct ObservationParser;

impl ObservationParser {
    pub fn new() -> Self {
        ObservationParser
    }

    /// Parses `raw`. Optional data that is missing or malformed is simply left out.
    ///
    /// # Errors
    ///
    /// [`ParseError::MalformedMessage`] when the `MSH` header can't be located or decoded.
    pub fn parse(&self, raw: &str) -> Result<ParsedObservationMessage, ParseError> {
        let message = Message::parse(raw)?;
        let msh = message.header();

        let mut parsed = ParsedObservationMessage {
            message_control_id: msh.text(10).unwrap_or_default(),
            message_date_time_utc: timestamp::to_utc_or_now(msh.component(7, 1).as_deref()),
            data_source_name: msh.component(3, 1),
            device_id: msh.component(4, 1),
            ..ParsedObservationMessage::default()
        };

        let is_observation_result = msh
            .component(9, 1)
            .map(|kind| kind.eq_ignore_ascii_case(OBSERVATION_RESULT_TYPE))
            .unwrap_or(false);

        if is_observation_result {
            for group in patient_results(&message) {
                if let Some(pid) = group.patient {
                    apply_patient(&mut parsed, pid);
                }
                for order in &group.orders {
                    let placer_order_number = order
                        .common_order
                        .and_then(|orc| orc.component(2, 1))
                        .or_else(|| order.request.and_then(|obr| obr.component(2, 1)));
                    first_wins(&mut parsed.order_number, placer_order_number);

                    parsed
                        .observations
                        .extend(order.observations.iter().map(|obx| observation(obx)));
                }
            }
        } else {
            debug!(
                "HL7: Message {} is not an observation result, no observations extracted",
                parsed.message_control_id
            );
        }

        debug!(
            "HL7: Parsed message {} with {} observation(s)",
            parsed.message_control_id,
            parsed.observations.len()
        );
        Ok(parsed)
    }
}

/// Rebuilds the patient/order/observation nesting from the flat segment list.
fn patient_results(message: &Message) -> Vec<PatientResult<'_>> {
    let mut groups: Vec<PatientResult<'_>> = Vec::new();

    for segment in message.segments().iter().skip(1) {
        match segment.id() {
            "PID" => groups.push(PatientResult {
                patient: Some(segment),
                orders: Vec::new(),
            }),
            "ORC" => current_patient(&mut groups).orders.push(OrderObservation {
                common_order: Some(segment),
                ..OrderObservation::default()
            }),
            "OBR" => {
                let orders = &mut current_patient(&mut groups).orders;
                // an OBR completes the group its ORC opened, otherwise it opens its own
                let completes_common_order = matches!(
                    orders.last(),
                    Some(order) if order.common_order.is_some()
                        && order.request.is_none()
                        && order.observations.is_empty()
                );
                match orders.last_mut() {
                    Some(order) if completes_common_order => order.request = Some(segment),
                    _ => {
                        let order = OrderObservation {
                            request: Some(segment),
                            ..OrderObservation::default()
                        };
                        orders.push(order);
                    }
                }
            }
            "OBX" => current_order(&mut groups).observations.push(segment),
            _ => {}
        }
    }

    groups
}

// Analyzers regularly skip PID or OBR; results are still attached to an implicit group.
fn current_patient<'g, 'a>(groups: &'g mut Vec<PatientResult<'a>>) -> &'g mut PatientResult<'a> {
    if groups.is_empty() {
        groups.push(PatientResult::default());
    }
    let last = groups.len() - 1;
    &mut groups[last]
}

fn current_order<'g, 'a>(groups: &'g mut Vec<PatientResult<'a>>) -> &'g mut OrderObservation<'a> {
    let orders = &mut current_patient(groups).orders;
    if orders.is_empty() {
        orders.push(OrderObservation::default());
    }
    let last = orders.len() - 1;
    &mut orders[last]
}

fn apply_patient(parsed: &mut ParsedObservationMessage, pid: &Segment) {
    first_wins(&mut parsed.patient_id, pid.component(3, 1));
    first_wins(&mut parsed.patient_sequence_number, pid.component(18, 1));

    first_wins(&mut parsed.patient_name_last, pid.subcomponent(5, 1, 1));
    first_wins(&mut parsed.patient_name_first, pid.component(5, 2));
    first_wins(&mut parsed.patient_name_middle, pid.component(5, 3));
    let name = join_present(
        [
            &parsed.patient_name_last,
            &parsed.patient_name_first,
            &parsed.patient_name_middle,
        ],
        "^",
    );
    first_wins(&mut parsed.patient_name, name);

    first_wins(&mut parsed.patient_sex, pid.text(8));

    let street = pid.subcomponent(11, 1, 1);
    let city = pid.component(11, 3);
    let state = pid.component(11, 4);
    let postal = pid.component(11, 5);
    first_wins(
        &mut parsed.patient_address,
        join_present([&street, &city, &state, &postal], " "),
    );

    first_wins(
        &mut parsed.patient_phone,
        pid.component(13, 1).or_else(|| pid.component(13, 9)),
    );
    first_wins(&mut parsed.patient_race, pid.component(10, 1));
}

fn observation(obx: &Segment) -> ObservationRecord {
    ObservationRecord {
        observation_id: obx.component(3, 1).unwrap_or_default(),
        observation_text: obx.component(3, 2),
        observation_id_1: obx.component(3, 2),
        observation_id_2: obx.component(3, 3),
        observation_id_3: obx.component(3, 4),
        observation_id_4: obx.component(3, 5),
        value: obx.text(5),
        units: obx.component(6, 1),
        reference_range: obx.text(7),
        abnormal_flags: obx.text(8),
        observation_date_time_utc: obx
            .component(14, 1)
            .map(|ts| timestamp::to_utc_or_now(Some(&ts))),
        result_sequence_number: obx.text(1),
        result_status: obx.text(11),
        result_operator_id: obx
            .component(16, 1)
            .or_else(|| obx.subcomponent(16, 2, 1)),
    }
}

fn first_wins(slot: &mut Option<String>, candidate: Option<String>) {
    if slot.is_none() {
        *slot = candidate.filter(|value| !value.is_empty());
    }
}

fn join_present<const N: usize>(parts: [&Option<String>; N], separator: &str) -> Option<String> {
    let joined = parts
        .iter()
        .filter_map(|part| part.as_deref())
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>()
        .join(separator);
    (!joined.is_empty()).then_some(joined)
}
