//! MeterValues handler

use chrono::Utc;
use rust_ocpp::v1_6::messages::meter_values::MeterValuesResponse;
use rust_ocpp::v1_6::types::{Measurand, UnitOfMeasure};
use tracing::{debug, info};

use super::messages::{MeterValuesRequest, SampledValue};
use super::HandlerResult;
use crate::application::handlers::OcppV16Processor;
use crate::domain::events::{DomainEvent, MeterValuesEvent};
use crate::interfaces::ws::dispatcher::DispatchContext;

/// Latest readings found in one MeterValues request
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Readings {
    energy_wh: Option<f64>,
    power_w: Option<f64>,
    soc: Option<f64>,
}

fn scaled(sample: &SampledValue, value: f64) -> f64 {
    match sample.unit {
        Some(UnitOfMeasure::KWh) | Some(UnitOfMeasure::Kw) => value * 1000.0,
        _ => value,
    }
}

fn extract(req: &MeterValuesRequest) -> Readings {
    let mut readings = Readings::default();
    for meter_value in &req.meter_value {
        for sample in &meter_value.sampled_value {
            let Ok(value) = sample.value.trim().parse::<f64>() else {
                debug!(value = sample.value.as_str(), "Skipping non-numeric sampled value");
                continue;
            };
            // An absent measurand means Energy.Active.Import.Register.
            match &sample.measurand {
                None | Some(Measurand::EnergyActiveImportRegister) => {
                    readings.energy_wh = Some(scaled(sample, value))
                }
                Some(Measurand::PowerActiveImport) => readings.power_w = Some(scaled(sample, value)),
                Some(Measurand::SoC) => readings.soc = Some(value),
                Some(_) => {}
            }
        }
    }
    readings
}

pub async fn handle_meter_values(
    processor: &OcppV16Processor,
    ctx: &DispatchContext,
    req: MeterValuesRequest,
) -> HandlerResult<MeterValuesResponse> {
    let charge_point_id = ctx.charge_point_id();
    let readings = extract(&req);

    info!(
        charge_point_id,
        connector_id = req.connector_id,
        transaction_id = ?req.transaction_id,
        energy_wh = ?readings.energy_wh,
        power_w = ?readings.power_w,
        soc = ?readings.soc,
        "MeterValues"
    );

    if let (Some(transaction_id), Some(energy_wh)) = (req.transaction_id, readings.energy_wh) {
        processor
            .transactions
            .record_meter_value(charge_point_id, transaction_id, energy_wh);
    }

    let timestamp = req
        .meter_value
        .last()
        .map(|mv| mv.timestamp)
        .unwrap_or_else(Utc::now);

    let event = DomainEvent::MeterValuesReceived(MeterValuesEvent {
        charge_point_id: charge_point_id.to_string(),
        connector_id: req.connector_id,
        transaction_id: req.transaction_id,
        energy_wh: readings.energy_wh,
        power_w: readings.power_w,
        soc: readings.soc,
        timestamp,
    });

    Ok((MeterValuesResponse {}, vec![event]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::handlers::ocpp_v16::decode;
    use serde_json::json;

    #[test]
    fn missing_measurand_is_energy_and_wh_passes_through() {
        let req: MeterValuesRequest = decode(json!({
            "connectorId": 1,
            "meterValue": [{
                "timestamp": "2024-01-01T00:00:00Z",
                "sampledValue": [{"value": "1500"}, {"value": "n/a", "measurand": "SoC"}]
            }]
        }))
        .unwrap();
        assert_eq!(
            extract(&req),
            Readings {
                energy_wh: Some(1500.0),
                power_w: None,
                soc: None
            }
        );
    }
}
