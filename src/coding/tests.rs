//! Coding Engine Tests
//!
//! ## Test Scopes
//! - **Encode/Decode**: Decoding any `k` survivors reproduces the erased slots exactly.
//! - **Fold**: Incremental deltas agree with a full re-encode.
//! - **Failures**: Too few survivors and out-of-range byte ranges fail the call, not the process.

#[cfg(test)]
mod tests {
    use crate::coding::CodingEngine;
    use crate::error::EngineError;
    use proptest::prelude::*;

    fn encode_stripe(engine: &CodingEngine, data: &[Vec<u8>]) -> Vec<Option<Vec<u8>>> {
        let len = data[0].len();
        let inputs: Vec<Option<&[u8]>> = data.iter().map(|d| Some(d.as_slice())).collect();
        let mut stripe: Vec<Option<Vec<u8>>> = data.iter().cloned().map(Some).collect();
        for parity_index in 0..engine.parity_chunks() {
            let mut parity = vec![0u8; len];
            engine
                .encode(&inputs, &mut parity, parity_index, 0..len)
                .unwrap();
            stripe.push(Some(parity));
        }
        stripe
    }

    // ============================================================
    // ENCODE TESTS
    // ============================================================

    #[test]
    fn test_first_parity_is_plain_xor() {
        let engine = CodingEngine::new(3, 2).unwrap();
        let data = vec![vec![0x0f; 8], vec![0xf0; 8], vec![0x33; 8]];
        let stripe = encode_stripe(&engine, &data);

        assert_eq!(stripe[3].as_ref().unwrap(), &vec![0x0f ^ 0xf0 ^ 0x33; 8]);
        for d in 0..3 {
            assert_eq!(engine.coefficient(0, d), 1);
        }
    }

    #[test]
    fn test_encode_treats_missing_input_as_zero() {
        let engine = CodingEngine::new(3, 1).unwrap();
        let chunk = vec![7u8; 16];
        let mut parity = vec![0xaa; 16];

        engine
            .encode(&[Some(chunk.as_slice()), None, None], &mut parity, 0, 0..16)
            .unwrap();

        assert_eq!(parity, chunk);
    }

    #[test]
    fn test_encode_only_touches_requested_range() {
        let engine = CodingEngine::new(2, 1).unwrap();
        let a = vec![1u8; 8];
        let b = vec![2u8; 8];
        let mut parity = vec![0xee; 8];

        engine
            .encode(&[Some(a.as_slice()), Some(b.as_slice())], &mut parity, 0, 2..5)
            .unwrap();

        assert_eq!(parity, vec![0xee, 0xee, 3, 3, 3, 0xee, 0xee, 0xee]);
    }

    #[test]
    fn test_encode_out_of_range_fails_operation() {
        let engine = CodingEngine::new(2, 1).unwrap();
        let a = vec![1u8; 4];
        let mut parity = vec![0u8; 8];

        let result = engine.encode(&[Some(a.as_slice()), None], &mut parity, 0, 0..8);
        assert!(matches!(result, Err(EngineError::OutOfRange { .. })));
    }

    // ============================================================
    // FOLD TESTS
    // ============================================================

    #[test]
    fn test_fold_matches_full_reencode() {
        let engine = CodingEngine::new(3, 2).unwrap();
        let mut data = vec![vec![10u8; 12], vec![20u8; 12], vec![30u8; 12]];
        let mut stripe = encode_stripe(&engine, &data);

        let new_bytes = [0x55u8, 0x66, 0x77];
        let delta: Vec<u8> = data[1][4..7]
            .iter()
            .zip(new_bytes.iter())
            .map(|(old, new)| old ^ new)
            .collect();
        data[1][4..7].copy_from_slice(&new_bytes);

        for parity_index in 0..2 {
            let parity = stripe[3 + parity_index].as_mut().unwrap();
            engine.fold(parity, parity_index, 1, 4, &delta).unwrap();
        }

        let expected = encode_stripe(&engine, &data);
        assert_eq!(stripe, expected);
    }

    // ============================================================
    // DECODE TESTS
    // ============================================================

    #[test]
    fn test_decode_single_data_loss_by_xor() {
        let engine = CodingEngine::new(3, 1).unwrap();
        let data = vec![b"alpha---".to_vec(), b"bravo---".to_vec(), b"charlie-".to_vec()];
        let mut stripe = encode_stripe(&engine, &data);
        stripe[1] = None;

        let rebuilt = engine.decode(&mut stripe).unwrap();

        assert_eq!(rebuilt, vec![1]);
        assert_eq!(stripe[1].as_ref().unwrap(), &data[1]);
    }

    #[test]
    fn test_decode_two_losses_with_two_parities() {
        let engine = CodingEngine::new(4, 2).unwrap();
        let data: Vec<Vec<u8>> = (0..4u8).map(|i| (0..32u8).map(|b| b.wrapping_mul(i + 3)).collect()).collect();
        let original = encode_stripe(&engine, &data);

        for first in 0..6 {
            for second in (first + 1)..6 {
                let mut stripe = original.clone();
                stripe[first] = None;
                stripe[second] = None;
                engine.decode(&mut stripe).unwrap();
                assert_eq!(stripe, original, "lost {} and {}", first, second);
            }
        }
    }

    #[test]
    fn test_decode_nothing_missing_is_noop() {
        let engine = CodingEngine::new(2, 1).unwrap();
        let mut stripe = encode_stripe(&engine, &[vec![1u8; 4], vec![2u8; 4]]);
        assert!(engine.decode(&mut stripe).unwrap().is_empty());
    }

    #[test]
    fn test_decode_with_too_few_chunks_fails() {
        let engine = CodingEngine::new(3, 1).unwrap();
        let mut stripe = encode_stripe(&engine, &[vec![1u8; 4], vec![2u8; 4], vec![3u8; 4]]);
        stripe[0] = None;
        stripe[2] = None;

        let result = engine.decode(&mut stripe);
        assert_eq!(
            result,
            Err(EngineError::InsufficientChunks {
                available: 2,
                required: 3
            })
        );
    }

    // ============================================================
    // PROPERTIES
    // ============================================================

    proptest! {
        #[test]
        fn proptest_decode_inverts_encode(
            k in 1usize..6,
            m in 1usize..4,
            len in 1usize..48,
            seed in any::<u64>(),
            erasure_mask in any::<u32>(),
        ) {
            let engine = CodingEngine::new(k, m).unwrap();
            let data: Vec<Vec<u8>> = (0..k)
                .map(|d| (0..len).map(|b| (seed.rotate_left((d * 7 + b) as u32 % 64) as u8) ^ (b as u8)).collect())
                .collect();
            let original = encode_stripe(&engine, &data);

            let mut stripe = original.clone();
            let mut erased = 0;
            for slot in 0..(k + m) {
                if erased < m && erasure_mask & (1 << slot) != 0 {
                    stripe[slot] = None;
                    erased += 1;
                }
            }
            if erased == 0 {
                stripe[0] = None;
            }

            engine.decode(&mut stripe).unwrap();
            prop_assert_eq!(stripe, original);
        }
    }
}
