use crate::models::DailyLedger;

/// Fold one closed trade into the day's ledger
///
/// `day_fees` is the summed fee total for every trade of the date, including
/// the one being recorded. `balance_after` is the account balance after the
/// close; on the first trade of the day it backs out the opening balance.
/// A zero-pnl close counts as neither profit nor loss.
pub fn record_close(
    ledger: &mut DailyLedger,
    realized_pnl: f64,
    day_fees: f64,
    balance_after: f64,
) {
    if ledger.trade_count == 0 {
        ledger.opening_balance = balance_after - realized_pnl;
    }

    ledger.trade_count += 1;
    if realized_pnl > 0.0 {
        ledger.profit_count += 1;
    } else if realized_pnl < 0.0 {
        ledger.loss_count += 1;
    }

    ledger.gross_profit += realized_pnl;
    ledger.total_fees = day_fees;
    ledger.net_profit = ledger.gross_profit - ledger.total_fees;
    // Rate of the whole day against its opening balance, not of this trade
    ledger.profit_rate = if ledger.opening_balance > 0.0 {
        (balance_after - ledger.opening_balance) / ledger.opening_balance
    } else {
        0.0
    };
}
