//! NSE trading-symbol rules
//!
//! The broker reports holdings and orders under the full trading symbol,
//! which may carry an exchange-series suffix (`RELIANCE-EQ`, `RELIANCE-BE`,
//! ...). Order and LTP-cache keys always use the full symbol; de-duplication
//! across series and historical lookups use the stripped base ticker.

/// Series suffixes the broker may attach to a base ticker
pub const SERIES_SUFFIXES: &[&str] = &["-EQ", "-BE", "-BL", "-BZ"];

/// Strip a series suffix, if any, returning the base ticker
pub fn base_ticker(trading_symbol: &str) -> &str {
    for suffix in SERIES_SUFFIXES {
        if let Some(base) = trading_symbol.strip_suffix(suffix) {
            return base;
        }
    }
    trading_symbol
}

/// All symbol variants the broker may present for a base ticker
pub fn variants(base: &str) -> Vec<String> {
    let mut all = Vec::with_capacity(SERIES_SUFFIXES.len() + 1);
    all.push(base.to_string());
    for suffix in SERIES_SUFFIXES {
        all.push(format!("{}{}", base, suffix));
    }
    all
}

/// Whether two trading symbols refer to the same listed instrument
pub fn same_instrument(a: &str, b: &str) -> bool {
    base_ticker(a).eq_ignore_ascii_case(base_ticker(b))
}

/// Default trading symbol for a base ticker (normal equity series)
pub fn equity_symbol(base: &str) -> String {
    format!("{}-EQ", base)
}

/// Symbol used for historical chart lookups (NSE listing on the chart API)
pub fn history_symbol(base: &str) -> String {
    format!("{}.NS", base_ticker(base))
}
