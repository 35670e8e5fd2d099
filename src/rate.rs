use std::time::Duration;

const BYTES_PER_SEC_PER_MBPS: f64 = 1_000_000.0 / 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickBudget {
    pub packets: u64,
    pub bytes: u64,
}

/// Bytes a rate of `target_mbps` would put on the wire in `interval_secs`.
pub fn ideal_bytes(target_mbps: f64, interval_secs: f64) -> f64 {
    if !target_mbps.is_finite() || target_mbps <= 0.0 || interval_secs <= 0.0 {
        return 0.0;
    }
    target_mbps * BYTES_PER_SEC_PER_MBPS * interval_secs
}

/// One token-bucket step: refill with the interval's ideal budget, spend it
/// in whole packets and keep the remainder for the next tick.
///
/// The returned byte count never exceeds `ideal + carry_over`, and the new
/// carry-over is never negative. Bucket capacity is one tick's ideal budget,
/// but never less than one packet, otherwise rates below one packet per tick
/// would never send anything.
pub fn next_tick_budget(
    target_mbps: f64,
    interval_secs: f64,
    carry_over: f64,
    packet_size: usize,
) -> (TickBudget, f64) {
    let ideal = ideal_bytes(target_mbps, interval_secs);
    let carry_over = if carry_over.is_finite() {
        carry_over.max(0.0)
    } else {
        0.0
    };
    if packet_size == 0 {
        return (TickBudget::default(), 0.0);
    }

    let packet = packet_size as f64;
    let available = ideal + carry_over;
    let packets = (available / packet).floor() as u64;
    let bytes = packets * packet_size as u64;
    let remainder = available - bytes as f64;
    let carry = remainder.clamp(0.0, ideal.max(packet));

    (TickBudget { packets, bytes }, carry)
}

/// Turns the envelope's instantaneous target into per-tick packet counts.
///
/// Each tick is charged for the time that actually passed since the previous
/// one, so a late tick sends proportionally more and the long-run average
/// follows the target. The charge is capped at `max_catch_up_ticks` nominal
/// intervals to keep a stalled loop from releasing one huge burst.
#[derive(Debug)]
pub struct RateController {
    packet_size: usize,
    max_interval: Duration,
    carry: f64,
}

impl RateController {
    pub fn new(packet_size: usize, tick_interval: Duration, max_catch_up_ticks: u32) -> Self {
        Self {
            packet_size,
            max_interval: tick_interval * max_catch_up_ticks.max(1),
            carry: 0.0,
        }
    }

    pub fn next_tick(&mut self, target_mbps: f64, since_last_tick: Duration) -> TickBudget {
        let interval = since_last_tick.min(self.max_interval).as_secs_f64();
        let (budget, carry) =
            next_tick_budget(target_mbps, interval, self.carry, self.packet_size);
        self.carry = carry;
        budget
    }
}
