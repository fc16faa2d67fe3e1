use crate::engine::state::EngineState;
use crate::models::{Band, Side};

/// Order intent attached to a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Open(Side),
    Close,
}

/// One planned step of the machine: where to go and what order, if any,
/// must succeed before the step commits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub next: EngineState,
    pub action: Option<Action>,
    pub reason: &'static str,
}

/// Inputs of a single evaluation
#[derive(Debug, Clone, Copy)]
pub struct Ctx {
    /// Last closed bar's close
    pub close: f64,
    /// Latest tick, or `close` when no tick has arrived yet
    pub tick: f64,
    pub lower: f64,
    pub middle: f64,
    pub upper: f64,
}

impl Ctx {
    pub fn new(close: f64, tick: f64, band: &Band) -> Self {
        Self {
            close,
            tick,
            lower: band.lower,
            middle: band.middle,
            upper: band.upper,
        }
    }
}

/// One row of the transition table
struct Rule {
    when: fn(&Ctx) -> bool,
    next: EngineState,
    action: Option<Action>,
    reason: &'static str,
}

// Predicates. All close-price driven except the two wait-profit exits,
// which fire on the tick to capture reversals without bar-close latency.

fn close_above_upper(c: &Ctx) -> bool {
    c.close > c.upper
}

fn close_below_lower(c: &Ctx) -> bool {
    c.close < c.lower
}

fn close_back_under_upper_above_mid(c: &Ctx) -> bool {
    c.close <= c.upper && c.close >= c.middle
}

fn close_back_over_lower_below_mid(c: &Ctx) -> bool {
    c.close > c.lower && c.close <= c.middle
}

fn close_below_mid(c: &Ctx) -> bool {
    c.close < c.middle
}

fn close_above_mid(c: &Ctx) -> bool {
    c.close > c.middle
}

fn tick_above_lower(c: &Ctx) -> bool {
    c.tick > c.lower
}

fn tick_below_upper(c: &Ctx) -> bool {
    c.tick < c.upper
}

fn always(_: &Ctx) -> bool {
    true
}

/// Outgoing transition table for a state
///
/// The rules of each state are mutually exclusive for any fixed input, so
/// first-match is the only match (checked by test below).
fn outgoing(state: EngineState) -> &'static [Rule] {
    use EngineState::*;
    match state {
        Waiting => &[
            Rule {
                when: close_above_upper,
                next: BreakoutUpWaitFall,
                action: None,
                reason: "close broke above upper band",
            },
            Rule {
                when: close_below_lower,
                next: BreakdownDnWaitBounce,
                action: None,
                reason: "close broke below lower band",
            },
        ],
        // Entry arms: a close back inside the band opens only while it is
        // still at or above the midline; below it the up-move has collapsed
        // and the machine keeps waiting.
        BreakoutUpWaitFall | ShortStopLossWaitFall => &[Rule {
            when: close_back_under_upper_above_mid,
            next: HoldingShort,
            action: Some(Action::Open(Side::Short)),
            reason: "close fell back under upper band above midline",
        }],
        BreakdownDnWaitBounce | LongStopLossWaitBounce => &[Rule {
            when: close_back_over_lower_below_mid,
            next: HoldingLong,
            action: Some(Action::Open(Side::Long)),
            reason: "close bounced over lower band below midline",
        }],
        HoldingShort => &[
            Rule {
                when: close_above_upper,
                next: ShortStopLossWaitFall,
                action: Some(Action::Close),
                reason: "protective stop: close re-broke upper band",
            },
            Rule {
                when: close_below_mid,
                next: ShortBelowMidWait,
                action: None,
                reason: "close fell under midline, take-profit path begins",
            },
        ],
        HoldingLong => &[
            Rule {
                when: close_below_lower,
                next: LongStopLossWaitBounce,
                action: Some(Action::Close),
                reason: "protective stop: close re-broke lower band",
            },
            Rule {
                when: close_above_mid,
                next: LongAboveMidWait,
                action: None,
                reason: "close rose over midline, take-profit path begins",
            },
        ],
        ShortBelowMidWait => &[
            Rule {
                when: close_above_mid,
                next: ShortProfitTaken,
                action: Some(Action::Close),
                reason: "close bounced back over midline, locking profit",
            },
            Rule {
                when: close_below_lower,
                next: ShortWaitProfit,
                action: None,
                reason: "close broke lower band, switching to tick exit watch",
            },
        ],
        LongAboveMidWait => &[
            Rule {
                when: close_above_upper,
                next: LongWaitProfit,
                action: None,
                reason: "close broke upper band, switching to tick exit watch",
            },
            Rule {
                when: close_below_mid,
                next: LongProfitTaken,
                action: Some(Action::Close),
                reason: "close fell back under midline, locking profit",
            },
        ],
        // The only tick-driven exits in the machine
        ShortWaitProfit => &[Rule {
            when: tick_above_lower,
            next: Waiting,
            action: Some(Action::Close),
            reason: "tick crossed back over lower band",
        }],
        LongWaitProfit => &[Rule {
            when: tick_below_upper,
            next: Waiting,
            action: Some(Action::Close),
            reason: "tick crossed back under upper band",
        }],
        // One-step resets
        ShortProfitTaken => &[Rule {
            when: always,
            next: Waiting,
            action: None,
            reason: "profit taken, resuming entry watch",
        }],
        LongProfitTaken => &[Rule {
            when: always,
            next: Waiting,
            action: None,
            reason: "profit taken, resuming entry watch",
        }],
    }
}

/// Plan at most one transition for the given state and inputs
pub fn plan(state: EngineState, ctx: &Ctx) -> Option<Transition> {
    outgoing(state)
        .iter()
        .find(|rule| (rule.when)(ctx))
        .map(|rule| Transition {
            next: rule.next,
            action: rule.action,
            reason: rule.reason,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use EngineState::*;

    fn ctx(close: f64, tick: f64) -> Ctx {
        Ctx {
            close,
            tick,
            lower: 95.0,
            middle: 100.0,
            upper: 105.0,
        }
    }

    #[test]
    fn test_rules_mutually_exclusive_per_state() {
        // Price grid crossing every band boundary from both sides
        let prices: Vec<f64> = (80..=120).map(|p| p as f64).collect();
        for state in EngineState::ALL {
            let rules = outgoing(state);
            for &close in &prices {
                for &tick in &prices {
                    let c = ctx(close, tick);
                    let matching = rules.iter().filter(|r| (r.when)(&c)).count();
                    assert!(
                        matching <= 1,
                        "{state} has {matching} matching transitions at close={close} tick={tick}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_waiting_breakout_up() {
        let t = plan(Waiting, &ctx(106.0, 106.0)).unwrap();
        assert_eq!(t.next, BreakoutUpWaitFall);
        assert_eq!(t.action, None);
    }

    #[test]
    fn test_waiting_breakdown_dn() {
        let t = plan(Waiting, &ctx(94.0, 94.0)).unwrap();
        assert_eq!(t.next, BreakdownDnWaitBounce);
        assert_eq!(t.action, None);
    }

    #[test]
    fn test_waiting_holds_inside_band() {
        assert_eq!(plan(Waiting, &ctx(100.0, 100.0)), None);
        assert_eq!(plan(Waiting, &ctx(105.0, 105.0)), None); // on the band, not beyond
        assert_eq!(plan(Waiting, &ctx(95.0, 95.0)), None);
    }

    #[test]
    fn test_short_entry_requires_fall_above_mid() {
        // 104 is back under the upper band and >= mid: open short
        let t = plan(BreakoutUpWaitFall, &ctx(104.0, 104.0)).unwrap();
        assert_eq!(t.next, HoldingShort);
        assert_eq!(t.action, Some(Action::Open(Side::Short)));

        // 98 is back under the upper band but below mid: no tradable re-entry
        assert_eq!(plan(BreakoutUpWaitFall, &ctx(98.0, 98.0)), None);

        // still above the band: keep waiting
        assert_eq!(plan(BreakoutUpWaitFall, &ctx(107.0, 107.0)), None);
    }

    #[test]
    fn test_stop_loss_state_reenters_like_breakout_state() {
        let t = plan(ShortStopLossWaitFall, &ctx(103.0, 103.0)).unwrap();
        assert_eq!(t.next, HoldingShort);
        assert_eq!(t.action, Some(Action::Open(Side::Short)));

        let t = plan(LongStopLossWaitBounce, &ctx(97.0, 97.0)).unwrap();
        assert_eq!(t.next, HoldingLong);
        assert_eq!(t.action, Some(Action::Open(Side::Long)));
    }

    #[test]
    fn test_long_entry_requires_bounce_below_mid() {
        let t = plan(BreakdownDnWaitBounce, &ctx(96.0, 96.0)).unwrap();
        assert_eq!(t.next, HoldingLong);
        assert_eq!(t.action, Some(Action::Open(Side::Long)));

        // bounced but above mid: the down-move has fully reversed, keep waiting
        assert_eq!(plan(BreakdownDnWaitBounce, &ctx(102.0, 102.0)), None);
        assert_eq!(plan(BreakdownDnWaitBounce, &ctx(93.0, 93.0)), None);
    }

    #[test]
    fn test_holding_short_stop_loss() {
        let t = plan(HoldingShort, &ctx(106.0, 106.0)).unwrap();
        assert_eq!(t.next, ShortStopLossWaitFall);
        assert_eq!(t.action, Some(Action::Close));
    }

    #[test]
    fn test_holding_short_take_profit_path() {
        let t = plan(HoldingShort, &ctx(99.0, 99.0)).unwrap();
        assert_eq!(t.next, ShortBelowMidWait);
        assert_eq!(t.action, None); // position stays open

        // between mid and upper: hold
        assert_eq!(plan(HoldingShort, &ctx(102.0, 102.0)), None);
    }

    #[test]
    fn test_short_below_mid_branches() {
        // bounce over mid: lock profit
        let t = plan(ShortBelowMidWait, &ctx(101.0, 101.0)).unwrap();
        assert_eq!(t.next, ShortProfitTaken);
        assert_eq!(t.action, Some(Action::Close));

        // extension through the lower band: switch to tick watch
        let t = plan(ShortBelowMidWait, &ctx(94.0, 94.0)).unwrap();
        assert_eq!(t.next, ShortWaitProfit);
        assert_eq!(t.action, None);

        assert_eq!(plan(ShortBelowMidWait, &ctx(97.0, 97.0)), None);
    }

    #[test]
    fn test_short_wait_profit_fires_on_tick_not_close() {
        // close is still below the lower band but the tick crossed back over
        let t = plan(ShortWaitProfit, &ctx(94.0, 96.0)).unwrap();
        assert_eq!(t.next, Waiting);
        assert_eq!(t.action, Some(Action::Close));

        // tick still below the band: keep watching
        assert_eq!(plan(ShortWaitProfit, &ctx(94.0, 94.5)), None);
    }

    #[test]
    fn test_long_mirror_path() {
        let t = plan(HoldingLong, &ctx(94.0, 94.0)).unwrap();
        assert_eq!(t.next, LongStopLossWaitBounce);
        assert_eq!(t.action, Some(Action::Close));

        let t = plan(HoldingLong, &ctx(101.0, 101.0)).unwrap();
        assert_eq!(t.next, LongAboveMidWait);
        assert_eq!(t.action, None);

        let t = plan(LongAboveMidWait, &ctx(106.0, 106.0)).unwrap();
        assert_eq!(t.next, LongWaitProfit);
        assert_eq!(t.action, None);

        let t = plan(LongAboveMidWait, &ctx(99.0, 99.0)).unwrap();
        assert_eq!(t.next, LongProfitTaken);
        assert_eq!(t.action, Some(Action::Close));

        let t = plan(LongWaitProfit, &ctx(106.0, 104.0)).unwrap();
        assert_eq!(t.next, Waiting);
        assert_eq!(t.action, Some(Action::Close));
    }

    #[test]
    fn test_profit_taken_resets_unconditionally() {
        for close in [80.0, 100.0, 120.0] {
            let t = plan(ShortProfitTaken, &ctx(close, close)).unwrap();
            assert_eq!(t.next, Waiting);
            assert_eq!(t.action, None);

            let t = plan(LongProfitTaken, &ctx(close, close)).unwrap();
            assert_eq!(t.next, Waiting);
            assert_eq!(t.action, None);
        }
    }

    #[test]
    fn test_open_transitions_target_holding_states() {
        // Cross-check the planner against the holding classification
        let prices: Vec<f64> = (90..=110).map(|p| p as f64).collect();
        for state in EngineState::ALL {
            for &close in &prices {
                if let Some(t) = plan(state, &ctx(close, close)) {
                    match t.action {
                        Some(Action::Open(side)) => {
                            assert_eq!(t.next.holding_side(), Some(side));
                        }
                        Some(Action::Close) => assert!(!t.next.is_holding()),
                        None => {}
                    }
                }
            }
        }
    }
}
