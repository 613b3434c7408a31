use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Buy,
    Sell,
    BuyLimit,
    SellLimit,
    BuyStop,
    SellStop,
}

impl OrderKind {
    pub fn side(&self) -> Side {
        match self {
            OrderKind::Buy | OrderKind::BuyLimit | OrderKind::BuyStop => Side::Buy,
            OrderKind::Sell | OrderKind::SellLimit | OrderKind::SellStop => Side::Sell,
        }
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self, OrderKind::Buy | OrderKind::Sell)
    }
}

/// Contract details the terminal reports for a symbol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub pip_size: f64,
    pub digits: u32,
    pub volume_min: f64,
    pub volume_step: f64,
    pub volume_max: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    pub fn spread(&self) -> f64 {
        (self.ask - self.bid).max(0.0)
    }

    /// Price a market order on `side` fills at.
    pub fn fill_price(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }

    /// Price an open position on `side` would close at.
    pub fn close_price(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub kind: OrderKind,
    pub volume: f64,
    /// Requested price. Ignored for market kinds beyond the deviation check.
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Maximum accepted distance from `price` for market fills.
    pub deviation: f64,
    /// Ownership tag carried by the resulting order/position.
    pub tag: String,
    pub comment: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub ticket: u64,
    /// True when the order opened a position, false when it rests pending.
    pub filled: bool,
    pub price: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TerminalPosition {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub tag: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub ticket: u64,
    pub symbol: String,
    pub kind: OrderKind,
    pub volume: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub tag: String,
}
