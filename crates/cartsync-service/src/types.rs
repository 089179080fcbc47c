//! The cart data model, and its JSON representation on the wire.

use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::sync::Arc;

use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize, Serializer};

/// An exact monetary amount with two fractional digits.
///
/// Stored as integer minor units, so sums never accumulate rounding errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Price {
    cents: i64,
}

impl Price {
    pub const ZERO: Price = Price { cents: 0 };

    pub const fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    pub const fn cents(self) -> i64 {
        self.cents
    }

    /// Parses a decimal string such as `"9.99"`.
    ///
    /// Digits past the second fractional digit are rounded half away from zero.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (negative, value) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value.strip_prefix('+').unwrap_or(value)),
        };
        let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        let is_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if !is_digits(whole) || !is_digits(fraction) {
            return None;
        }

        let whole: i64 = match whole {
            "" => 0,
            whole => whole.parse().ok()?,
        };
        let mut digits = fraction.bytes().map(|b| i64::from(b - b'0'));
        let tenths = digits.next().unwrap_or(0);
        let hundredths = digits.next().unwrap_or(0);
        let round_up = digits.next().is_some_and(|d| d >= 5);

        let cents = whole
            .checked_mul(100)?
            .checked_add(tenths * 10 + hundredths + i64::from(round_up))?;
        Some(Self::from_cents(if negative { -cents } else { cents }))
    }

    /// Converts a JSON number, rounding to the nearest cent.
    pub fn from_f64(value: f64) -> Option<Self> {
        let cents = (value * 100.0).round();
        if !cents.is_finite() || cents.abs() >= i64::MAX as f64 {
            return None;
        }
        Some(Self::from_cents(cents as i64))
    }

    /// The price of `quantity` units, saturating instead of overflowing.
    pub fn times(self, quantity: u32) -> Self {
        Self::from_cents(self.cents.saturating_mul(i64::from(quantity)))
    }
}

impl Add for Price {
    type Output = Price;

    fn add(self, rhs: Price) -> Price {
        Price::from_cents(self.cents.saturating_add(rhs.cents))
    }
}

impl Sum for Price {
    fn sum<I: Iterator<Item = Price>>(iter: I) -> Self {
        iter.fold(Price::ZERO, Add::add)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.cents < 0 { "-" } else { "" };
        let cents = self.cents.unsigned_abs();
        write!(f, "{sign}{}.{:02}", cents / 100, cents % 100)
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The server-side identifier of a product.
///
/// The cart endpoint reports numeric ids, but ids are only ever compared and sent back, so they
/// are kept as text.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ProductId(Arc<str>);

impl ProductId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<u64> for ProductId {
    fn from(id: u64) -> Self {
        Self::new(id.to_string())
    }
}

/// One product in the cart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CartLine {
    pub product_id: ProductId,
    pub name: String,
    pub unit_price: Price,
    /// Always at least `1`.
    pub quantity: u32,
    pub image_ref: String,
}

impl CartLine {
    pub fn line_total(&self) -> Price {
        self.unit_price.times(self.quantity)
    }
}

/// The cart as last reported by the server.
///
/// A snapshot is never modified after it was created. A new fetch produces a new snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CartSnapshot {
    lines: Vec<CartLine>,
}

impl CartSnapshot {
    pub fn new(lines: Vec<CartLine>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    /// Total number of units across all lines.
    pub fn item_count(&self) -> u64 {
        self.lines.iter().map(|line| u64::from(line.quantity)).sum()
    }

    pub fn subtotal(&self) -> Price {
        self.lines.iter().map(CartLine::line_total).sum()
    }

    /// Parses the body of a cart read.
    ///
    /// An empty body, or a JSON `null`, means the user has no cart and yields `None`.
    pub fn from_body(body: &str) -> Result<Option<Self>, serde_json::Error> {
        if body.trim().is_empty() {
            return Ok(None);
        }
        let raw: Option<RawCart> = serde_json::from_str(body)?;
        Ok(raw.map(Self::from))
    }
}

/// The resolved value delivered to callers and subscribers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Cart {
    /// No cart: nothing fetched yet, the user is not logged in, or the last read failed.
    #[default]
    Empty,
    /// The cart as reported by the last successful read.
    Snapshot(Arc<CartSnapshot>),
}

impl Cart {
    pub fn snapshot(&self) -> Option<&Arc<CartSnapshot>> {
        match self {
            Cart::Empty => None,
            Cart::Snapshot(snapshot) => Some(snapshot),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Cart::Empty)
    }

    pub fn lines(&self) -> &[CartLine] {
        self.snapshot().map_or(&[], |snapshot| snapshot.lines())
    }

    pub fn item_count(&self) -> u64 {
        self.snapshot().map_or(0, |snapshot| snapshot.item_count())
    }

    pub fn subtotal(&self) -> Price {
        self.snapshot()
            .map_or(Price::ZERO, |snapshot| snapshot.subtotal())
    }

    /// Whether both values are the very same snapshot object, not only equal in content.
    pub fn ptr_eq(&self, other: &Cart) -> bool {
        match (self, other) {
            (Cart::Empty, Cart::Empty) => true,
            (Cart::Snapshot(a), Cart::Snapshot(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<CartSnapshot> for Cart {
    fn from(snapshot: CartSnapshot) -> Self {
        Cart::Snapshot(Arc::new(snapshot))
    }
}

/// The body of a cart read, `{ "items": [...] }`.
#[derive(Debug, Deserialize)]
struct RawCart {
    #[serde(default)]
    items: Option<Vec<RawItem>>,
}

/// A single entry of `items`. Entries that are not objects are skipped instead of failing the
/// whole cart.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawItem {
    Line(RawCartLine),
    Invalid(IgnoredAny),
}

/// Every field is parsed leniently, a value of the wrong type falls back to the field's default.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCartLine {
    #[serde(default)]
    product_id: Option<RawScalar>,
    #[serde(default)]
    name: Option<RawScalar>,
    #[serde(default)]
    price: Option<RawScalar>,
    #[serde(default)]
    quantity: Option<RawScalar>,
    #[serde(default)]
    image_url: Option<RawScalar>,
}

/// Ids, prices and quantities arrive either as JSON strings or as numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Integer(i64),
    Float(f64),
    Text(String),
    Other(IgnoredAny),
}

impl RawScalar {
    fn into_product_id(self) -> Option<ProductId> {
        match self {
            RawScalar::Integer(id) => Some(ProductId::new(id.to_string())),
            RawScalar::Float(id) => Some(ProductId::new(id.to_string())),
            RawScalar::Text(id) if id.is_empty() => None,
            RawScalar::Text(id) => Some(ProductId::new(id)),
            RawScalar::Other(_) => None,
        }
    }

    fn into_text(self) -> Option<String> {
        match self {
            RawScalar::Text(text) => Some(text),
            _ => None,
        }
    }

    fn to_price(&self) -> Option<Price> {
        match self {
            RawScalar::Integer(value) => value.checked_mul(100).map(Price::from_cents),
            RawScalar::Float(value) => Price::from_f64(*value),
            RawScalar::Text(value) => Price::parse(value),
            RawScalar::Other(_) => None,
        }
    }

    /// A positive quantity, fractional quantities are rounded down.
    fn to_quantity(&self) -> Option<u32> {
        match self {
            RawScalar::Integer(value) if *value >= 1 => {
                Some(u32::try_from(*value).unwrap_or(u32::MAX))
            }
            // `as` saturates at the bounds of `u32`.
            RawScalar::Float(value) if value.is_finite() && *value >= 1.0 => Some(*value as u32),
            RawScalar::Text(value) => {
                let value = value.trim();
                let parsed = match value.parse::<i64>() {
                    Ok(integer) => RawScalar::Integer(integer),
                    Err(_) => RawScalar::Float(value.parse().ok()?),
                };
                parsed.to_quantity()
            }
            _ => None,
        }
    }
}

impl From<RawCart> for CartSnapshot {
    fn from(raw: RawCart) -> Self {
        let lines = raw
            .items
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| {
                let RawItem::Line(item) = item else {
                    tracing::debug!("Skipping cart line that is not an object");
                    return None;
                };
                let Some(product_id) = item.product_id.and_then(RawScalar::into_product_id) else {
                    tracing::debug!("Skipping cart line without a product id");
                    return None;
                };
                let unit_price = item
                    .price
                    .as_ref()
                    .and_then(RawScalar::to_price)
                    .unwrap_or(Price::ZERO);
                let quantity = item
                    .quantity
                    .as_ref()
                    .and_then(RawScalar::to_quantity)
                    .unwrap_or(1);

                Some(CartLine {
                    product_id,
                    name: item
                        .name
                        .and_then(RawScalar::into_text)
                        .filter(|name| !name.is_empty())
                        .unwrap_or_else(|| "Product".to_owned()),
                    unit_price,
                    quantity,
                    image_ref: item
                        .image_url
                        .and_then(RawScalar::into_text)
                        .unwrap_or_default(),
                })
            })
            .collect();

        CartSnapshot { lines }
    }
}
