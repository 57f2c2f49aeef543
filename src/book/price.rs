use std::fmt;
use std::hash::{Hash, Hasher};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Price expressed as an integer count of ticks.
///
/// Equality and hashing use the tick count only; all prices handled
/// together are scoped to one symbol and therefore share a scale.
#[derive(Debug, Clone, Copy)]
pub struct ScaledPrice {
    value: i64,
    scale: i64,
}

impl ScaledPrice {
    /// Ticks per price unit for a tick size, e.g. "0.01" -> 100.
    pub fn scale_for_tick(tick_size: Decimal) -> Option<i64> {
        if tick_size <= Decimal::ZERO {
            return None;
        }
        (Decimal::ONE / tick_size).round().to_i64().filter(|s| *s > 0)
    }

    pub fn from_price_and_tick(price: Decimal, tick_size: Decimal) -> Self {
        let scale = Self::scale_for_tick(tick_size).expect("tick size within 64-bit tick range");
        Self::from_price(price, scale)
    }

    /// Construct from an already-resolved symbol scale.
    pub fn from_price(price: Decimal, scale: i64) -> Self {
        let value = (price * Decimal::from(scale))
            .round()
            .to_i64()
            .expect("price within 64-bit tick range");
        Self { value, scale }
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    /// The price `offset` ticks away; negative offsets walk down the book.
    pub fn next(&self, offset: i64) -> Self {
        Self {
            value: self.value + offset,
            scale: self.scale,
        }
    }

    /// Whether `ask` sits exactly one tick above this bid.
    pub fn is_next_ask_for_bid(&self, ask: &ScaledPrice) -> bool {
        self.value + 1 == ask.value
    }

    pub fn to_decimal(&self) -> Decimal {
        Decimal::from(self.value) / Decimal::from(self.scale)
    }
}

impl PartialEq for ScaledPrice {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for ScaledPrice {}

impl Hash for ScaledPrice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for ScaledPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal().normalize())
    }
}
