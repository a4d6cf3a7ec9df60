use std::collections::HashMap;

use proptest::prelude::*;
use serde_json::Value;

use accrete::{Comparator, Condition, RetryPolicy, RetryState, RetryStep};

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
    ]
}

fn attributes_strategy() -> impl Strategy<Value = HashMap<String, Value>> {
    proptest::collection::hash_map("[a-z]{1,4}", value_strategy(), 0..6)
}

proptest! {
    #[test]
    fn double_negation_preserves_evaluation(
        attributes in attributes_strategy(),
        key in "[a-z]{1,4}",
        expected in value_strategy(),
    ) {
        let global = HashMap::new();
        let condition = Condition::attribute(key, expected);
        let doubled = condition.clone().negate().negate();
        prop_assert_eq!(
            condition.evaluate(&attributes, &global),
            doubled.evaluate(&attributes, &global),
        );
    }

    #[test]
    fn conjunction_commutes(
        attributes in attributes_strategy(),
        key_a in "[a-z]{1,4}",
        key_b in "[a-z]{1,4}",
        expected_a in value_strategy(),
        expected_b in value_strategy(),
    ) {
        let global = HashMap::new();
        let a = Condition::attribute(key_a, expected_a);
        let b = Condition::attribute(key_b, expected_b);
        let ab = a.clone().and(b.clone());
        let ba = b.and(a);
        prop_assert_eq!(
            ab.evaluate(&attributes, &global),
            ba.evaluate(&attributes, &global),
        );
    }

    #[test]
    fn disjunction_agrees_with_de_morgan(
        attributes in attributes_strategy(),
        key_a in "[a-z]{1,4}",
        key_b in "[a-z]{1,4}",
        expected_a in value_strategy(),
        expected_b in value_strategy(),
    ) {
        let global = HashMap::new();
        let a = Condition::attribute(key_a, expected_a);
        let b = Condition::attribute(key_b, expected_b);
        let either = a.clone().or(b.clone());
        let de_morgan = a.negate().and(b.negate()).negate();
        prop_assert_eq!(
            either.evaluate(&attributes, &global),
            de_morgan.evaluate(&attributes, &global),
        );
    }

    #[test]
    fn exists_never_errors(
        attributes in attributes_strategy(),
        key in "[a-z]{1,4}",
    ) {
        let global = HashMap::new();
        let condition = Condition::attribute_cmp(key.clone(), Value::Null, Comparator::Exists);
        let result = condition.evaluate(&attributes, &global);
        prop_assert_eq!(result, Ok(attributes.contains_key(&key)));
    }

    #[test]
    fn retry_machine_spends_the_full_budget(
        handler_count in 1usize..4,
        max_retries in 0u32..5,
    ) {
        let policy = RetryPolicy { max_retries, backoff_factor: 2.0 };
        let mut state = RetryState::default();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let (next, step) = policy.next_step(state, handler_count);
            state = next;
            match step {
                RetryStep::Backoff(_) | RetryStep::NextHandler => {
                    prop_assert!(attempts < 1_000, "retry machine failed to terminate");
                }
                RetryStep::GiveUp => break,
            }
        }
        // Every handler absorbs its initial attempt plus max_retries retries.
        prop_assert_eq!(attempts, handler_count as u32 * (max_retries + 1));
    }

    #[test]
    fn backoff_schedule_is_monotonic(
        factor in 1.0f64..4.0,
        retry in 1u32..8,
    ) {
        let policy = RetryPolicy { max_retries: 8, backoff_factor: factor };
        prop_assert!(policy.base_delay(retry + 1) >= policy.base_delay(retry));
    }
}
