use serde::{Deserialize, Serialize};

use crate::models::Side;

/// Discrete states of the band-crossing decision machine
///
/// Initial state is `Waiting`; there is no terminal state, the machine cycles
/// indefinitely. The short and long sides mirror each other.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Flat, waiting for a close outside the band
    Waiting,

    // Short side
    /// Close broke above the upper band; waiting for it to fall back under
    BreakoutUpWaitFall,
    HoldingShort,
    /// Short was stopped out; waiting for another fall under the upper band
    ShortStopLossWaitFall,
    /// Close fell under the midline; waiting for a bounce or a lower-band break
    ShortBelowMidWait,
    /// Close broke the lower band; exit fires on the tick, not the next close
    ShortWaitProfit,
    ShortProfitTaken,

    // Long side
    /// Close broke below the lower band; waiting for the bounce back over it
    BreakdownDnWaitBounce,
    HoldingLong,
    LongStopLossWaitBounce,
    LongAboveMidWait,
    LongWaitProfit,
    LongProfitTaken,
}

impl EngineState {
    /// States in which a position is open (invariant: a Position record
    /// exists iff the machine is in one of these)
    pub fn holding_side(&self) -> Option<Side> {
        match self {
            EngineState::HoldingShort
            | EngineState::ShortBelowMidWait
            | EngineState::ShortWaitProfit => Some(Side::Short),
            EngineState::HoldingLong
            | EngineState::LongAboveMidWait
            | EngineState::LongWaitProfit => Some(Side::Long),
            _ => None,
        }
    }

    pub fn is_holding(&self) -> bool {
        self.holding_side().is_some()
    }

    /// Initial state for a recovered position of the given side
    pub fn holding(side: Side) -> EngineState {
        match side {
            Side::Long => EngineState::HoldingLong,
            Side::Short => EngineState::HoldingShort,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Waiting => "waiting",
            EngineState::BreakoutUpWaitFall => "breakout_up_wait_fall",
            EngineState::HoldingShort => "holding_short",
            EngineState::ShortStopLossWaitFall => "short_stop_loss_wait_fall",
            EngineState::ShortBelowMidWait => "short_below_mid_wait",
            EngineState::ShortWaitProfit => "short_wait_profit",
            EngineState::ShortProfitTaken => "short_profit_taken",
            EngineState::BreakdownDnWaitBounce => "breakdown_dn_wait_bounce",
            EngineState::HoldingLong => "holding_long",
            EngineState::LongStopLossWaitBounce => "long_stop_loss_wait_bounce",
            EngineState::LongAboveMidWait => "long_above_mid_wait",
            EngineState::LongWaitProfit => "long_wait_profit",
            EngineState::LongProfitTaken => "long_profit_taken",
        }
    }

    pub const ALL: [EngineState; 13] = [
        EngineState::Waiting,
        EngineState::BreakoutUpWaitFall,
        EngineState::HoldingShort,
        EngineState::ShortStopLossWaitFall,
        EngineState::ShortBelowMidWait,
        EngineState::ShortWaitProfit,
        EngineState::ShortProfitTaken,
        EngineState::BreakdownDnWaitBounce,
        EngineState::HoldingLong,
        EngineState::LongStopLossWaitBounce,
        EngineState::LongAboveMidWait,
        EngineState::LongWaitProfit,
        EngineState::LongProfitTaken,
    ];
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
