/*
 * Copyright (C) 2025 The Cpuboost Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::cpuboost::util::error::{new_error, BoxError};

const NANOS_PER_UNIT: i128 = 1_000_000_000;
const NANOS_PER_MILLI: i128 = 1_000_000;
const NANOS_PER_MICRO: i128 = 1_000;
const NANOS_PER_CENTI: i128 = 10_000_000;

/// Suffix family a quantity was expressed in. Arithmetic results are
/// reformatted within the same family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    DecimalSI,
    BinarySI,
    DecimalExponent,
}

/// Resource quantity compatible with the Kubernetes serialization format.
///
/// The value is held exactly in nanounits; the original source string is
/// retained so an unmodified quantity round-trips byte for byte.
#[derive(Clone, Debug)]
pub struct Quantity {
    nanos: i128,
    format: Format,
    raw: Option<String>,
}

impl Quantity {
    pub fn parse(input: &str) -> Result<Quantity, BoxError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(new_error("quantity string is empty"));
        }
        let (nanos, format) = parse_value(trimmed)?;
        Ok(Quantity {
            nanos,
            format,
            raw: Some(trimmed.to_string()),
        })
    }

    pub fn zero() -> Quantity {
        Quantity {
            nanos: 0,
            format: Format::DecimalSI,
            raw: None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }

    pub fn nanos(&self) -> i128 {
        self.nanos
    }

    /// Value multiplied by `(100 + percent) / 100`, rounded up at two
    /// decimal places. The suffix family of the source is preserved.
    pub fn increase_by_percent(&self, percent: i64) -> Quantity {
        let scaled = self.nanos * (100 + percent as i128);
        let centis = div_ceil(scaled, 100 * NANOS_PER_CENTI);
        Quantity {
            nanos: centis * NANOS_PER_CENTI,
            format: self.format,
            raw: None,
        }
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.nanos == other.nanos
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.nanos.cmp(&other.nanos)
    }
}

impl Default for Quantity {
    fn default() -> Self {
        Quantity::zero()
    }
}

impl FromStr for Quantity {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(raw) = &self.raw {
            return f.write_str(raw);
        }
        f.write_str(&canonical_string(self.nanos, self.format))
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(QuantityVisitor)
    }
}

struct QuantityVisitor;

impl Visitor<'_> for QuantityVisitor {
    type Value = Quantity;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a quantity string or number")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Quantity, E> {
        Quantity::parse(value).map_err(|e| E::custom(e.to_string()))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Quantity, E> {
        Quantity::parse(&value.to_string()).map_err(|e| E::custom(e.to_string()))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Quantity, E> {
        Quantity::parse(&value.to_string()).map_err(|e| E::custom(e.to_string()))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Quantity, E> {
        Quantity::parse(&format!("{}", value)).map_err(|e| E::custom(e.to_string()))
    }
}

fn div_ceil(num: i128, den: i128) -> i128 {
    let q = num / den;
    if num % den != 0 && (num >= 0) == (den >= 0) {
        q + 1
    } else {
        q
    }
}

fn parse_value(input: &str) -> Result<(i128, Format), BoxError> {
    let bytes = input.as_bytes();
    let mut pos = 0usize;
    let mut negative = false;
    if bytes[0] == b'+' || bytes[0] == b'-' {
        negative = bytes[0] == b'-';
        pos += 1;
    }

    let mut digits: i128 = 0;
    let mut frac_digits: u32 = 0;
    let mut seen_digit = false;
    let mut in_fraction = false;
    while pos < bytes.len() {
        match bytes[pos] {
            b'0'..=b'9' => {
                digits = digits
                    .checked_mul(10)
                    .and_then(|d| d.checked_add((bytes[pos] - b'0') as i128))
                    .ok_or_else(|| new_error(format!("quantity {} overflows", input)))?;
                if in_fraction {
                    frac_digits += 1;
                }
                seen_digit = true;
                pos += 1;
            }
            b'.' if !in_fraction => {
                in_fraction = true;
                pos += 1;
            }
            _ => break,
        }
    }
    if !seen_digit {
        return Err(new_error(format!("quantity {} has no digits", input)));
    }

    let rest = &input[pos..];
    let (dec_exp, bin_mul, format) = parse_suffix(input, rest)?;

    // value = digits * bin_mul * 10^(9 + dec_exp - frac_digits) nanounits
    let mut nanos = digits
        .checked_mul(bin_mul)
        .ok_or_else(|| new_error(format!("quantity {} overflows", input)))?;
    let exp = 9 + dec_exp - frac_digits as i32;
    if exp >= 0 {
        for _ in 0..exp {
            nanos = nanos
                .checked_mul(10)
                .ok_or_else(|| new_error(format!("quantity {} overflows", input)))?;
        }
    } else {
        // Sub-nanounit precision rounds up, matching the API server.
        let mut den: i128 = 1;
        for _ in 0..(-exp) {
            den *= 10;
        }
        nanos = div_ceil(nanos, den);
    }
    if negative {
        nanos = -nanos;
    }
    Ok((nanos, format))
}

fn parse_suffix(input: &str, rest: &str) -> Result<(i32, i128, Format), BoxError> {
    if rest.is_empty() {
        return Ok((0, 1, Format::DecimalSI));
    }
    // Scientific notation: 'e' or 'E' followed by a signed integer.
    let rest_bytes = rest.as_bytes();
    if (rest_bytes[0] == b'e' || rest_bytes[0] == b'E') && rest.len() > 1 {
        let tail = &rest[1..];
        let candidate = tail.strip_prefix(['+', '-']).unwrap_or(tail);
        if !candidate.is_empty() && candidate.bytes().all(|b| b.is_ascii_digit()) {
            let exp: i32 = tail
                .parse()
                .map_err(|_| new_error(format!("quantity {} has a bad exponent", input)))?;
            return Ok((exp, 1, Format::DecimalExponent));
        }
    }
    let decimal = match rest {
        "n" => Some(-9),
        "u" => Some(-6),
        "m" => Some(-3),
        "k" => Some(3),
        "M" => Some(6),
        "G" => Some(9),
        "T" => Some(12),
        "P" => Some(15),
        "E" => Some(18),
        _ => None,
    };
    if let Some(exp) = decimal {
        return Ok((exp, 1, Format::DecimalSI));
    }
    let binary: Option<i128> = match rest {
        "Ki" => Some(1 << 10),
        "Mi" => Some(1 << 20),
        "Gi" => Some(1 << 30),
        "Ti" => Some(1 << 40),
        "Pi" => Some(1 << 50),
        "Ei" => Some(1 << 60),
        _ => None,
    };
    if let Some(mul) = binary {
        return Ok((0, mul, Format::BinarySI));
    }
    Err(new_error(format!("quantity {} has unknown suffix {}", input, rest)))
}

fn canonical_string(nanos: i128, format: Format) -> String {
    let negative = nanos < 0;
    let abs = nanos.abs();
    let body = match format {
        Format::BinarySI if abs % NANOS_PER_UNIT == 0 => {
            let units = abs / NANOS_PER_UNIT;
            binary_string(units)
        }
        _ => decimal_string(abs),
    };
    if negative {
        format!("-{}", body)
    } else {
        body
    }
}

fn binary_string(units: i128) -> String {
    let suffixes: [(i128, &str); 6] = [
        (1 << 60, "Ei"),
        (1 << 50, "Pi"),
        (1 << 40, "Ti"),
        (1 << 30, "Gi"),
        (1 << 20, "Mi"),
        (1 << 10, "Ki"),
    ];
    for (mul, suffix) in suffixes {
        if units != 0 && units % mul == 0 {
            return format!("{}{}", units / mul, suffix);
        }
    }
    units.to_string()
}

fn decimal_string(abs: i128) -> String {
    if abs % NANOS_PER_UNIT == 0 {
        (abs / NANOS_PER_UNIT).to_string()
    } else if abs % NANOS_PER_MILLI == 0 {
        format!("{}m", abs / NANOS_PER_MILLI)
    } else if abs % NANOS_PER_MICRO == 0 {
        format!("{}u", abs / NANOS_PER_MICRO)
    } else {
        format!("{}n", abs)
    }
}
