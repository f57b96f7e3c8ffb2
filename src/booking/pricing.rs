use crate::engine::EngineError;
use crate::model::Amount;

/// Total price of `slot_count` slots at `base_hourly_charge` each.
pub fn charge(base_hourly_charge: Amount, slot_count: usize) -> Result<Amount, EngineError> {
    Amount::try_from(slot_count)
        .ok()
        .and_then(|n| base_hourly_charge.checked_mul(n))
        .ok_or(EngineError::LimitExceeded("booking total overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_is_base_times_count() {
        assert_eq!(charge(1000, 3).unwrap(), 3000);
        assert_eq!(charge(1000, 1).unwrap(), 1000);
        assert_eq!(charge(750, 24).unwrap(), 18_000);
    }

    #[test]
    fn free_machine_costs_nothing() {
        assert_eq!(charge(0, 24).unwrap(), 0);
    }

    #[test]
    fn overflow_is_an_error() {
        let result = charge(Amount::MAX, 2);
        assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
    }
}
