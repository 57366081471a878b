//! SI-prefix unit conversion.
//!
//! A fixed, case-sensitive prefix table maps unit prefixes to decimal
//! exponents. Long spelled-out prefixes are listed before the short
//! symbols so that "Milli" never matches as "M"+"illi", and "m" (milli)
//! and "M" (mega) resolve by exact case.

/// (prefix, decimal exponent). Order matters: longest names first.
static UNIT_PREFIXES: [(&str, f64); 50] = [
    ("Deka", 1.0),
    ("deka", 1.0),
    ("Hekto", 2.0),
    ("hekto", 2.0),
    ("kilo", 3.0),
    ("Kilo", 3.0),
    ("Mega", 6.0),
    ("mega", 6.0),
    ("Giga", 9.0),
    ("giga", 9.0),
    ("Tera", 12.0),
    ("tera", 12.0),
    ("Peta", 15.0),
    ("peta", 15.0),
    ("Exa", 18.0),
    ("exa", 18.0),
    ("Dezi", -1.0),
    ("dezi", -1.0),
    ("Zenti", -2.0),
    ("centi", -2.0),
    ("Micro", -6.0),
    ("micro", -6.0),
    ("Milli", -3.0),
    ("milli", -3.0),
    ("Nano", -9.0),
    ("nano", -9.0),
    ("Piko", -12.0),
    ("piko", -12.0),
    ("Femto", -15.0),
    ("femto", -15.0),
    ("Atto", -18.0),
    ("atto", -18.0),
    ("da", 1.0),
    ("h", 2.0),
    ("K", 3.0),
    ("k", 3.0),
    ("M", 6.0),
    ("G", 9.0),
    ("T", 12.0),
    ("P", 15.0),
    ("E", 18.0),
    ("d", -1.0),
    ("c", -2.0),
    ("mu", -6.0),
    ("u", -6.0),
    ("m", -3.0),
    ("n", -9.0),
    ("p", -12.0),
    ("f", -15.0),
    ("a", -18.0),
];

/// Splits a unit string like "100ms" into its leading numeric factor
/// (1.0 when absent) and the bare unit.
fn factor_and_unit(s: &str) -> (f64, &str) {
    let s = s.trim();
    let end = s
        .char_indices()
        .take_while(|(i, c)| {
            c.is_ascii_digit()
                || *c == '.'
                || ((*c == '+' || *c == '-') && *i == 0)
                || ((*c == 'e' || *c == 'E') && s[..*i].chars().any(|d| d.is_ascii_digit()))
        })
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    let factor = s[..end].parse::<f64>().unwrap_or(1.0);
    (factor, s[end..].trim())
}

/// Decimal exponent of the prefix carried by `unit`, 0 when the unit
/// carries none. The prefix must be a proper prefix: "mV" is milli-volt,
/// but plain "m" stays meter.
fn prefix_exponent(unit: &str) -> f64 {
    for (prefix, exponent) in UNIT_PREFIXES.iter() {
        if unit.starts_with(prefix) && prefix.len() < unit.len() {
            return *exponent;
        }
    }
    0.0
}

/// Converts `val` from `old_unit` to `new_unit`.
///
/// Units may carry leading numeric factors ("100ms"). When one side has
/// no unit, only the factors apply, except for the `%` ↔ `1` pair.
/// Round trips are exact up to floating-point rounding.
pub fn change_unit(val: f64, old_unit: &str, new_unit: &str) -> f64 {
    let (ov, ou) = factor_and_unit(old_unit);
    let (mut nv, nu) = factor_and_unit(new_unit);

    if ou.is_empty() || nu.is_empty() {
        if new_unit.trim() == "1" && old_unit.trim() == "%" {
            nv = 100.0;
        } else if new_unit.trim() == "%" && old_unit.trim() == "1" {
            nv = 0.01;
        }
        return val * ov / nv;
    }

    let e1 = prefix_exponent(ou);
    let e2 = prefix_exponent(nu);
    // scale by an exact positive power of ten; dividing instead of
    // multiplying by its inexact reciprocal keeps round trips tight
    let e = e1 - e2;
    let base = val * (ov / nv);
    if e >= 0.0 {
        base * 10f64.powf(e)
    } else {
        base / 10f64.powf(-e)
    }
}
