//! Virtual exchange wrapping a real market data source.
//!
//! Simulates order fills, fees, balances, and optionally margin
//! accounting against live or replayed tickers. Used both for
//! dry-run operation and for backtesting.
//!
//! The fill model is optimistic: an order is filled completely at
//! its stated price as soon as the market is at or through it, so
//! liquidity at the order price is assumed.

use crate::api::{Result, StockApi};
use pmm_core::{MarketInfo, Order, Price, Size, Ticker, Trade};
use rust_decimal::Decimal;
use tracing::{info, warn};

pub struct Emulator {
    source: Box<dyn StockApi>,
    orders: Vec<Order>,
    trades: Vec<Trade>,
    balance: Decimal,
    currency: Decimal,
    margin_currency: Decimal,
    minfo: Option<MarketInfo>,
    pair: String,
    margin: bool,
    initial_currency: Decimal,
    balance_read: bool,
    currency_read: bool,
    prev_id: u64,
}

impl Emulator {
    pub fn new(source: Box<dyn StockApi>, initial_currency: Decimal) -> Self {
        Self::with_id_seed(
            source,
            initial_currency,
            chrono::Utc::now().timestamp_millis() as u64,
        )
    }

    /// Pins the order/trade id seed; backtests use this so two runs
    /// over the same chart produce identical journals.
    pub fn with_id_seed(source: Box<dyn StockApi>, initial_currency: Decimal, seed: u64) -> Self {
        Self {
            source,
            orders: Vec::new(),
            trades: Vec::new(),
            balance: Decimal::ZERO,
            currency: Decimal::ZERO,
            margin_currency: Decimal::ZERO,
            minfo: None,
            pair: String::new(),
            margin: false,
            initial_currency,
            balance_read: false,
            currency_read: false,
            prev_id: seed,
        }
    }

    /// Preload balances, skipping the lazy read from the source.
    pub fn set_balances(&mut self, balance: Decimal, currency: Decimal) {
        self.balance = balance;
        self.currency = currency;
        self.balance_read = true;
        self.currency_read = true;
    }

    fn gen_id(&mut self) -> u64 {
        self.prev_id += 1;
        self.prev_id
    }

    fn read_source_balance(&mut self, symbol: &str, default: Decimal) -> Decimal {
        match self.source.balance(symbol) {
            Ok(v) => v,
            Err(e) => {
                warn!(symbol, default = %default, error = %e, "balance not available, using default");
                default
            }
        }
    }

    /// Walk open orders against a ticker, filling every order the
    /// market has crossed.
    ///
    /// An order rests while `(last - price) * size > 0`; otherwise it
    /// fills completely at its stated price and size.
    fn simulation(&mut self, tk: &Ticker) {
        let cur = tk.last.inner();
        let mut left = Vec::with_capacity(self.orders.len());
        let orders = std::mem::take(&mut self.orders);
        for o in orders {
            let diff = (cur - o.price.inner()) * o.size.inner();
            if diff > Decimal::ZERO {
                left.push(o);
                continue;
            }
            let (eff_size, eff_price) = match &self.minfo {
                Some(mi) => mi.remove_fees(o.size, o.price),
                None => (o.size, o.price),
            };
            let trade = Trade {
                id: self.gen_id(),
                time_ms: tk.time_ms,
                size: o.size,
                price: o.price,
                eff_size,
                eff_price,
            };
            info!(size = %o.size, price = %o.price, "emulator trade");
            if self.margin {
                if !self.balance.is_zero() {
                    let open_price = self.margin_currency / self.balance;
                    self.currency += self.balance * (o.price.inner() - open_price);
                }
                self.margin_currency += self.margin_currency - o.size.inner() * o.price.inner();
            } else {
                self.currency -= o.size.inner() * eff_price.inner();
            }
            self.balance += eff_size.inner();
            self.trades.push(trade);
        }
        self.orders = left;
    }
}

impl StockApi for Emulator {
    fn market_info(&mut self, pair: &str) -> Result<MarketInfo> {
        let mi = self.source.market_info(pair)?;
        self.margin = mi.is_margin();
        self.minfo = Some(mi.clone());
        Ok(mi)
    }

    fn ticker(&mut self, pair: &str) -> Result<Ticker> {
        self.pair = pair.to_string();
        let tk = self.source.ticker(pair)?;
        self.simulation(&tk);
        Ok(tk)
    }

    fn balance(&mut self, symbol: &str) -> Result<Decimal> {
        let (asset, currency) = match &self.minfo {
            Some(mi) => (mi.asset_symbol.clone(), mi.currency_symbol.clone()),
            None => (String::new(), String::new()),
        };
        if !asset.is_empty() && symbol == asset {
            if !self.balance_read {
                self.balance_read = true;
                self.balance = self.read_source_balance(symbol, Decimal::ZERO);
            }
            Ok(self.balance)
        } else if !currency.is_empty() && symbol == currency {
            if !self.currency_read {
                self.currency_read = true;
                self.currency = self.read_source_balance(symbol, self.initial_currency);
            }
            Ok(self.currency)
        } else {
            Ok(Decimal::ZERO)
        }
    }

    fn open_orders(&mut self, pair: &str) -> Result<Vec<Order>> {
        let tk = self.source.ticker(pair)?;
        self.simulation(&tk);
        Ok(self.orders.clone())
    }

    fn trades(&mut self, _last_seen_id: u64, _from_time_ms: i64, _pair: &str) -> Result<Vec<Trade>> {
        Ok(std::mem::take(&mut self.trades))
    }

    fn place_order(
        &mut self,
        _pair: &str,
        size: Size,
        price: Price,
        client_id: Option<&str>,
        replace_id: Option<u64>,
        _replace_size: Size,
    ) -> Result<Option<u64>> {
        if let Some(rid) = replace_id {
            let pos = self.orders.iter().position(|o| o.id == rid);
            return Ok(match pos {
                Some(i) if size.is_zero() => {
                    let removed = self.orders.remove(i);
                    Some(removed.id)
                }
                Some(i) => {
                    // Overwritten in place; the id is reused.
                    self.orders[i].size = size;
                    self.orders[i].price = price;
                    self.orders[i].client_id = client_id.map(str::to_string);
                    Some(rid)
                }
                None => None,
            });
        }
        let id = self.gen_id();
        self.orders
            .push(Order::new(id, client_id.map(str::to_string), size, price));
        Ok(Some(id))
    }

    fn fees(&mut self, pair: &str) -> Result<Decimal> {
        let fees = self.source.fees(pair)?;
        if let Some(mi) = &mut self.minfo {
            mi.fees = fees;
        }
        Ok(fees)
    }

    fn all_pairs(&mut self) -> Result<Vec<String>> {
        self.source.all_pairs()
    }

    fn reset(&mut self) -> Result<bool> {
        if !self.source.reset()? {
            return Ok(false);
        }
        if !self.pair.is_empty() {
            let pair = self.pair.clone();
            self.ticker(&pair)?;
        }
        Ok(true)
    }

    fn is_test(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplaySource;
    use pmm_core::FeeScheme;
    use rust_decimal_macros::dec;

    fn minfo(fees: Decimal, leverage: Decimal) -> MarketInfo {
        MarketInfo {
            asset_symbol: "BTC".into(),
            currency_symbol: "USD".into(),
            min_size: Size::new(dec!(0.001)),
            size_step: Size::new(dec!(0.001)),
            price_step: Price::new(dec!(0.01)),
            fees,
            leverage,
            fee_scheme: FeeScheme::Currency,
        }
    }

    fn tick(last: Decimal, t: i64) -> Ticker {
        Ticker::new(Price::new(last), Price::new(last), Price::new(last), t)
    }

    fn emulator(samples: Vec<Ticker>, fees: Decimal, leverage: Decimal) -> (Emulator, crate::ReplayHandle) {
        let (source, handle) = ReplaySource::new("BTCUSD", minfo(fees, leverage), samples);
        let mut emu = Emulator::with_id_seed(Box::new(source), dec!(1000), 0);
        emu.market_info("BTCUSD").unwrap();
        (emu, handle)
    }

    #[test]
    fn test_resting_order_not_crossed() {
        let (mut emu, _h) = emulator(vec![tick(dec!(100), 0)], dec!(0), dec!(0));
        emu.place_order("BTCUSD", Size::new(dec!(1)), Price::new(dec!(99)), Some("buy"), None, Size::ZERO)
            .unwrap();
        let orders = emu.open_orders("BTCUSD").unwrap();
        assert_eq!(orders.len(), 1);
        assert!(emu.trades(0, 0, "BTCUSD").unwrap().is_empty());
    }

    #[test]
    fn test_buy_fills_when_market_reaches_price() {
        let (mut emu, h) = emulator(vec![tick(dec!(100), 0), tick(dec!(99), 1)], dec!(0), dec!(0));
        // Balances are read at cycle start, before any fill; the
        // asset defaults to 0 and the currency to initial_currency.
        assert_eq!(emu.balance("BTC").unwrap(), dec!(0));
        assert_eq!(emu.balance("USD").unwrap(), dec!(1000));
        emu.ticker("BTCUSD").unwrap();
        emu.place_order("BTCUSD", Size::new(dec!(1)), Price::new(dec!(99)), Some("buy"), None, Size::ZERO)
            .unwrap();
        h.step();
        emu.ticker("BTCUSD").unwrap();

        assert!(emu.open_orders("BTCUSD").unwrap().is_empty());
        let trades = emu.trades(0, 0, "BTCUSD").unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].size.inner(), dec!(1));
        assert_eq!(trades[0].price.inner(), dec!(99));
        assert_eq!(emu.balance("BTC").unwrap(), dec!(1));
        assert_eq!(emu.balance("USD").unwrap(), dec!(901));
    }

    #[test]
    fn test_sell_fills_when_market_rises_through() {
        let (mut emu, h) = emulator(vec![tick(dec!(100), 0), tick(dec!(102), 1)], dec!(0), dec!(0));
        emu.set_balances(dec!(2), dec!(0));
        emu.ticker("BTCUSD").unwrap();
        emu.place_order("BTCUSD", Size::new(dec!(-1)), Price::new(dec!(101)), Some("sell"), None, Size::ZERO)
            .unwrap();
        h.step();
        emu.ticker("BTCUSD").unwrap();

        let trades = emu.trades(0, 0, "BTCUSD").unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(emu.balance("BTC").unwrap(), dec!(1));
        assert_eq!(emu.balance("USD").unwrap(), dec!(101));
    }

    #[test]
    fn test_fees_applied_through_remove_fees() {
        let (mut emu, h) = emulator(
            vec![tick(dec!(100), 0), tick(dec!(99), 1)],
            dec!(0.001),
            dec!(0),
        );
        emu.balance("USD").unwrap();
        emu.ticker("BTCUSD").unwrap();
        emu.place_order("BTCUSD", Size::new(dec!(1)), Price::new(dec!(99)), Some("buy"), None, Size::ZERO)
            .unwrap();
        h.step();
        emu.ticker("BTCUSD").unwrap();

        let trades = emu.trades(0, 0, "BTCUSD").unwrap();
        assert_eq!(trades[0].eff_price.inner(), dec!(99.099));
        // Currency is charged the effective (fee-adjusted) price.
        assert_eq!(emu.balance("USD").unwrap(), dec!(1000) - dec!(99.099));
    }

    #[test]
    fn test_replace_reuses_id() {
        let (mut emu, _h) = emulator(vec![tick(dec!(100), 0)], dec!(0), dec!(0));
        let id = emu
            .place_order("BTCUSD", Size::new(dec!(1)), Price::new(dec!(98)), Some("buy"), None, Size::ZERO)
            .unwrap()
            .unwrap();
        let id2 = emu
            .place_order(
                "BTCUSD",
                Size::new(dec!(1)),
                Price::new(dec!(97)),
                Some("buy"),
                Some(id),
                Size::new(dec!(1)),
            )
            .unwrap()
            .unwrap();
        assert_eq!(id, id2);
        let orders = emu.open_orders("BTCUSD").unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].price.inner(), dec!(97));
    }

    #[test]
    fn test_replace_unknown_id_is_lost_race() {
        let (mut emu, _h) = emulator(vec![tick(dec!(100), 0)], dec!(0), dec!(0));
        let res = emu
            .place_order(
                "BTCUSD",
                Size::new(dec!(1)),
                Price::new(dec!(97)),
                Some("buy"),
                Some(777),
                Size::new(dec!(1)),
            )
            .unwrap();
        assert_eq!(res, None);
    }

    #[test]
    fn test_zero_size_replace_is_cancel() {
        let (mut emu, _h) = emulator(vec![tick(dec!(100), 0)], dec!(0), dec!(0));
        let id = emu
            .place_order("BTCUSD", Size::new(dec!(1)), Price::new(dec!(98)), Some("buy"), None, Size::ZERO)
            .unwrap()
            .unwrap();
        let res = emu
            .place_order("BTCUSD", Size::ZERO, Price::ZERO, None, Some(id), Size::ZERO)
            .unwrap();
        assert_eq!(res, Some(id));
        assert!(emu.open_orders("BTCUSD").unwrap().is_empty());
    }

    #[test]
    fn test_open_orders_idempotent_without_ticker_change() {
        let (mut emu, _h) = emulator(vec![tick(dec!(100), 0)], dec!(0), dec!(0));
        emu.place_order("BTCUSD", Size::new(dec!(1)), Price::new(dec!(99)), Some("buy"), None, Size::ZERO)
            .unwrap();
        let a = emu.open_orders("BTCUSD").unwrap();
        let b = emu.open_orders("BTCUSD").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_trades_buffer_is_consumed() {
        let (mut emu, h) = emulator(vec![tick(dec!(100), 0), tick(dec!(99), 1)], dec!(0), dec!(0));
        emu.ticker("BTCUSD").unwrap();
        emu.place_order("BTCUSD", Size::new(dec!(1)), Price::new(dec!(99)), Some("buy"), None, Size::ZERO)
            .unwrap();
        h.step();
        emu.ticker("BTCUSD").unwrap();
        assert_eq!(emu.trades(0, 0, "BTCUSD").unwrap().len(), 1);
        assert!(emu.trades(0, 0, "BTCUSD").unwrap().is_empty());
    }

    #[test]
    fn test_margin_accounting_formula() {
        let (mut emu, h) = emulator(
            vec![tick(dec!(100), 0), tick(dec!(99), 1), tick(dec!(98), 2)],
            dec!(0),
            dec!(10),
        );
        emu.set_balances(dec!(0), dec!(1000));
        emu.ticker("BTCUSD").unwrap();
        emu.place_order("BTCUSD", Size::new(dec!(1)), Price::new(dec!(99)), Some("buy"), None, Size::ZERO)
            .unwrap();
        h.step();
        emu.ticker("BTCUSD").unwrap();

        // First fill opens the position: no P/L realized, the virtual
        // quote accumulator moves by -size*price.
        assert_eq!(emu.balance("BTC").unwrap(), dec!(1));
        assert_eq!(emu.balance("USD").unwrap(), dec!(1000));
        assert_eq!(emu.margin_currency, dec!(-99));

        emu.place_order("BTCUSD", Size::new(dec!(1)), Price::new(dec!(98)), Some("buy"), None, Size::ZERO)
            .unwrap();
        h.step();
        emu.ticker("BTCUSD").unwrap();

        // Second fill realizes P/L against the open price of -99:
        // currency += 1 * (98 - (-99)) = +197, and
        // margin_currency += margin_currency - 1*98 = -99 - 98 - 99.
        assert_eq!(emu.balance("BTC").unwrap(), dec!(2));
        assert_eq!(emu.balance("USD").unwrap(), dec!(1197));
        assert_eq!(emu.margin_currency, dec!(-296));
    }
}
