//! MeterValues
//!
//! Carries energy register samples. The sample is pulled from the metering
//! hardware through a sampler closure; until the hardware has a reading the
//! operation reports "not ready" and the engine polls it again next tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ocpp_rpc::{Operation, RequestPayload};

use super::payload_or_not_ready;

/// One energy register reading.
#[derive(Debug, Clone, Copy)]
pub struct MeterSample {
    pub timestamp: DateTime<Utc>,
    pub energy_wh: i64,
}

/// Pull interface to the metering hardware. `None` means no fresh reading
/// yet.
pub type Sampler = Box<dyn FnMut() -> Option<MeterSample> + Send>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SampledValue {
    value: String,
    measurand: String,
    unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeterValueEntry {
    timestamp: DateTime<Utc>,
    sampled_value: Vec<SampledValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeterValuesRequest {
    connector_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction_id: Option<i64>,
    meter_value: Vec<MeterValueEntry>,
}

pub struct MeterValues {
    connector_id: u32,
    transaction_id: Option<i64>,
    sampler: Sampler,
    sample: Option<MeterSample>,
}

impl MeterValues {
    pub fn new(connector_id: u32, transaction_id: Option<i64>, sampler: Sampler) -> Self {
        Self {
            connector_id,
            transaction_id,
            sampler,
            sample: None,
        }
    }
}

impl Operation for MeterValues {
    fn operation_type(&self) -> &str {
        "MeterValues"
    }

    fn create_request_payload(&mut self) -> RequestPayload {
        if self.sample.is_none() {
            self.sample = (self.sampler)();
        }
        let Some(sample) = self.sample else {
            return RequestPayload::NotReady;
        };

        payload_or_not_ready(&MeterValuesRequest {
            connector_id: self.connector_id,
            transaction_id: self.transaction_id,
            meter_value: vec![MeterValueEntry {
                timestamp: sample.timestamp,
                sampled_value: vec![SampledValue {
                    value: sample.energy_wh.to_string(),
                    measurand: "Energy.Active.Import.Register".to_string(),
                    unit: "Wh".to_string(),
                }],
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_until_sampler_yields() {
        let mut readings = vec![
            None,
            Some(MeterSample {
                timestamp: Utc::now(),
                energy_wh: 1500,
            }),
        ]
        .into_iter();

        let mut op = MeterValues::new(1, Some(7), Box::new(move || readings.next().flatten()));

        assert!(matches!(op.create_request_payload(), RequestPayload::NotReady));
        match op.create_request_payload() {
            RequestPayload::Ready(v) => {
                assert_eq!(v["connectorId"], 1);
                assert_eq!(v["transactionId"], 7);
                assert_eq!(v["meterValue"][0]["sampledValue"][0]["value"], "1500");
            }
            _ => panic!("Expected Ready"),
        }
    }

    #[test]
    fn test_sample_taken_once() {
        let mut calls = 0;
        let sample = MeterSample {
            timestamp: Utc::now(),
            energy_wh: 10,
        };
        // Sampler would fail the test if pulled again after yielding.
        let mut op = MeterValues::new(
            1,
            None,
            Box::new(move || {
                calls += 1;
                assert_eq!(calls, 1);
                Some(sample)
            }),
        );

        assert!(matches!(op.create_request_payload(), RequestPayload::Ready(_)));
        assert!(matches!(op.create_request_payload(), RequestPayload::Ready(_)));
    }
}
