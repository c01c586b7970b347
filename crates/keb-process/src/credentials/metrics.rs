// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-runtime state gauge of the reconciled secret.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Gauge, Meter};

pub const METER_NAME: &str = "keb-runtime-reconciler";
pub const SECRET_STATE_GAUGE: &str = "kcp_keb_v2_btp_manager_secret_state";

const STATE_SKIPPED: &str = "skipped";
const STATE_RECONCILED: &str = "reconciled";

/// Two series per runtime, `state=skipped` and `state=reconciled`; the one
/// describing the current state is 1, the other 0.
#[derive(Clone)]
pub struct SecretStateMetrics {
    gauge: Gauge<u64>,
}

impl SecretStateMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            gauge: meter
                .u64_gauge(SECRET_STATE_GAUGE)
                .with_description("State of the BTP manager secret per runtime")
                .build(),
        }
    }

    /// Gauge on the globally installed meter provider.
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter(METER_NAME))
    }

    pub fn record(&self, runtime_id: &str, skipped: bool) {
        let (on, off) = if skipped {
            (STATE_SKIPPED, STATE_RECONCILED)
        } else {
            (STATE_RECONCILED, STATE_SKIPPED)
        };
        self.gauge.record(1, &attributes(runtime_id, on));
        self.gauge.record(0, &attributes(runtime_id, off));
    }
}

fn attributes(runtime_id: &str, state: &'static str) -> [KeyValue; 2] {
    [
        KeyValue::new("runtime", runtime_id.to_string()),
        KeyValue::new("state", state),
    ]
}
