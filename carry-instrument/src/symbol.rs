use serde::{Deserialize, Deserializer, Serialize};
use smol_str::SmolStr;
use std::fmt::{Display, Formatter};

/// Carry new type representing a canonical perpetual-futures market identifier.
///
/// Canonical form is `BASE/QUOTE:SETTLE`, upper-cased, eg/ "BTC/USDT:USDT". Venue-native
/// representations ("BTCUSDT", "BTC-USDT-SWAP", etc) exist only inside venue adapters.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct Symbol(SmolStr);

impl Symbol {
    /// Construct a new [`Symbol`] from the provided canonical `BASE/QUOTE[:SETTLE]` value.
    ///
    /// Input is upper-cased; a missing `:SETTLE` suffix defaults the settlement currency to the
    /// quote currency (linear perpetual convention).
    pub fn new<S>(input: S) -> Self
    where
        S: AsRef<str>,
    {
        let upper = input.as_ref().to_uppercase();
        if upper.contains(':') {
            Self(SmolStr::new(upper))
        } else if let Some((_, quote)) = upper.split_once('/') {
            Self(SmolStr::new(format!("{upper}:{quote}")))
        } else {
            Self(SmolStr::new(upper))
        }
    }

    /// Base currency, eg/ "BTC" for "BTC/USDT:USDT".
    pub fn base(&self) -> &str {
        self.0.split(['/', ':']).next().unwrap_or(&self.0)
    }

    /// Quote currency, eg/ "USDT" for "BTC/USDT:USDT".
    pub fn quote(&self) -> &str {
        self.0
            .split_once('/')
            .map(|(_, rest)| rest.split(':').next().unwrap_or(rest))
            .unwrap_or(&self.0)
    }

    /// Settlement currency, eg/ "USDT" for "BTC/USDT:USDT".
    pub fn settle(&self) -> &str {
        self.0.split_once(':').map(|(_, s)| s).unwrap_or_else(|| self.quote())
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Symbol::new)
    }
}

impl From<&str> for Symbol {
    fn from(input: &str) -> Self {
        Symbol::new(input)
    }
}

impl From<String> for Symbol {
    fn from(input: String) -> Self {
        Symbol::new(input)
    }
}
