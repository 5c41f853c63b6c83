//!
//! Utility module for the wallet sync engine.
//!
//! Formatting helpers used for log output throughout the codebase.

/// Render a raw token amount as a decimal string for display.
pub fn format_token_amount(amount: u128, decimals: u32) -> String {
    format!(
        "{:.*}",
        decimals as usize,
        amount as f64 / 10f64.powi(decimals as i32)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_token_decimals() {
        assert_eq!(format_token_amount(1_500_000, 6), "1.500000");
        assert_eq!(format_token_amount(0, 2), "0.00");
    }
}
