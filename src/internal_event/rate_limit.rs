use std::time::Duration;

use metrics::{Counter, Gauge, counter, gauge};

use super::registered_event;
use crate::rate_limit::PoolError;

#[derive(Clone, Copy, Debug)]
pub(crate) struct RefillCycleData {
    pub released: usize,
    pub failed: usize,
    pub effective_rate: usize,
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RampData {
    pub from: usize,
    pub to: usize,
    pub target: usize,
}

registered_event! {
    RefillCycleCompleted { instance: u64 } => {
        released: Counter = counter!("rate_limiter_permits_released_total", "instance" => instance.to_string()),
        effective_rate: Gauge = gauge!("rate_limiter_effective_rate", "instance" => instance.to_string()),
        instance: u64 = instance,
    }

    fn emit(&self, data: RefillCycleData) {
        self.released.increment(data.released as u64);
        self.effective_rate.set(data.effective_rate as f64);
        debug!(
            message = "Released permits.",
            instance = self.instance,
            released = data.released,
            failed = data.failed,
            effective_rate = data.effective_rate,
            elapsed_ms = data.elapsed.as_millis(),
        );
    }
}

registered_event! {
    SlowStartRamp { instance: u64 } => {
        effective_rate: Gauge = gauge!("rate_limiter_effective_rate", "instance" => instance.to_string()),
        instance: u64 = instance,
    }

    fn emit(&self, data: RampData) {
        self.effective_rate.set(data.to as f64);
        info!(
            message = "Raised effective rate.",
            instance = self.instance,
            from = data.from,
            to = data.to,
            target = data.target,
        );
    }
}

registered_event! {
    PermitReleaseFailed { instance: u64 } => {
        failures: Counter = counter!("rate_limiter_release_failures_total", "instance" => instance.to_string()),
        instance: u64 = instance,
    }

    fn emit(&self, error: &PoolError) {
        self.failures.increment(1);
        error!(message = "Failed while releasing permit.", instance = self.instance, %error);
    }
}

registered_event! {
    RefillJobTerminated { instance: u64 } => {
        failures: Counter = counter!("rate_limiter_refill_job_failures_total", "instance" => instance.to_string()),
        instance: u64 = instance,
    }

    fn emit(&self, reason: &str) {
        self.failures.increment(1);
        error!(
            message = "Refill job terminated; limiter will no longer replenish.",
            instance = self.instance,
            reason,
        );
    }
}

registered_event! {
    AdmissionDecision { limiter: &'static str } => {
        admitted: Counter = counter!("rate_limiter_admitted_total", "limiter" => limiter),
        rejected: Counter = counter!("rate_limiter_rejected_total", "limiter" => limiter),
    }

    fn emit(&self, admitted: bool) {
        if admitted {
            self.admitted.increment(1);
        } else {
            self.rejected.increment(1);
        }
    }
}
