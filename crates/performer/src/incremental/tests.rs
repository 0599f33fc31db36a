use super::*;
use crate::core::AttentionError;
use candle_core::{DType, Device, Tensor};

fn batch_rows(tensor: &Tensor) -> Vec<f32> {
    tensor
        .flatten_from(1)
        .unwrap()
        .narrow(1, 0, 1)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_dtype(DType::F32)
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

fn tagged_state(device: &Device, batch: usize) -> CacheState {
    // Every row starts with its batch index so permutations are easy to read.
    let keys = Tensor::arange(0f32, batch as f32, device)
        .unwrap()
        .reshape((batch, 1, 1, 1))
        .unwrap()
        .broadcast_as((batch, 2, 3, 4))
        .unwrap()
        .contiguous()
        .unwrap();
    let values = keys.affine(10.0, 0.0).unwrap();
    let mask = Tensor::arange(0u8, batch as u8, device)
        .unwrap()
        .reshape((batch, 1))
        .unwrap()
        .broadcast_as((batch, 3))
        .unwrap()
        .contiguous()
        .unwrap();
    CacheState {
        key_padding_mask: Some(mask),
        buffered_keys: Some(keys),
        buffered_values: Some(values),
    }
}

#[test]
fn reorder_permutes_every_buffer() {
    let device = Device::Cpu;
    let mut state = tagged_state(&device, 3);
    let order = Tensor::new(&[2u32, 0, 0], &device).unwrap();
    state.reorder(&order, false).unwrap();

    assert_eq!(batch_rows(state.buffered_keys.as_ref().unwrap()), vec![2.0, 0.0, 0.0]);
    assert_eq!(
        batch_rows(state.buffered_values.as_ref().unwrap()),
        vec![20.0, 0.0, 0.0]
    );
    assert_eq!(
        batch_rows(state.key_padding_mask.as_ref().unwrap()),
        vec![2.0, 0.0, 0.0]
    );
}

#[test]
fn reorder_can_expand_the_batch_for_beams() {
    let device = Device::Cpu;
    let mut state = tagged_state(&device, 2);
    let order = Tensor::new(&[0i64, 0, 1, 1], &device).unwrap();
    state.reorder(&order, false).unwrap();
    assert_eq!(state.buffered_keys.as_ref().unwrap().dims(), &[4, 2, 3, 4]);
    assert_eq!(
        batch_rows(state.buffered_keys.as_ref().unwrap()),
        vec![0.0, 0.0, 1.0, 1.0]
    );
}

#[test]
fn static_buffers_with_matching_batch_are_skipped() {
    let device = Device::Cpu;
    let mut state = tagged_state(&device, 3);
    let order = Tensor::new(&[2u32, 1, 0], &device).unwrap();
    state.reorder(&order, true).unwrap();
    assert_eq!(batch_rows(state.buffered_keys.as_ref().unwrap()), vec![0.0, 1.0, 2.0]);
}

#[test]
fn empty_state_reorders_to_itself() {
    let device = Device::Cpu;
    let mut state = CacheState::default();
    assert!(state.is_empty());
    let order = Tensor::new(&[1u32, 0], &device).unwrap();
    state.reorder(&order, false).unwrap();
    assert!(state.is_empty());
}

#[test]
fn reorder_rejects_matrix_orders() {
    let device = Device::Cpu;
    let mut state = tagged_state(&device, 2);
    let order = Tensor::zeros((2, 2), DType::U32, &device).unwrap();
    let err = state.reorder(&order, false).unwrap_err();
    assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
}

#[test]
fn padding_masks_merge_like_a_growing_frame() {
    let device = Device::Cpu;
    let prev = Tensor::new(&[[0u8, 1], [0, 0]], &device).unwrap();
    let cur = Tensor::new(&[[1u8], [0]], &device).unwrap();

    let both = append_prev_key_padding_mask(Some(&cur), Some(&prev), 2, 3, false)
        .unwrap()
        .unwrap();
    assert_eq!(
        both.to_vec2::<f32>().unwrap(),
        vec![vec![0.0, 1.0, 1.0], vec![0.0, 0.0, 0.0]]
    );

    let only_prev = append_prev_key_padding_mask(None, Some(&prev), 2, 3, false)
        .unwrap()
        .unwrap();
    assert_eq!(
        only_prev.to_vec2::<f32>().unwrap(),
        vec![vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 0.0]]
    );

    let only_cur = append_prev_key_padding_mask(Some(&cur), None, 2, 3, false)
        .unwrap()
        .unwrap();
    assert_eq!(
        only_cur.to_vec2::<f32>().unwrap(),
        vec![vec![0.0, 0.0, 1.0], vec![0.0, 0.0, 0.0]]
    );
}

#[test]
fn static_keys_keep_the_saved_mask() {
    let device = Device::Cpu;
    let prev = Tensor::new(&[[0u8, 1]], &device).unwrap();
    let cur = Tensor::new(&[[1u8]], &device).unwrap();
    let merged = append_prev_key_padding_mask(Some(&cur), Some(&prev), 1, 2, true)
        .unwrap()
        .unwrap();
    assert_eq!(merged.dtype(), DType::U8);
    assert_eq!(merged.to_vec2::<u8>().unwrap(), vec![vec![0, 1]]);

    assert!(append_prev_key_padding_mask(None, None, 1, 2, false)
        .unwrap()
        .is_none());
}

#[test]
fn oversized_mask_is_a_shape_error() {
    let device = Device::Cpu;
    let cur = Tensor::new(&[[0u8, 0, 0]], &device).unwrap();
    let err = append_prev_key_padding_mask(Some(&cur), None, 1, 2, false).unwrap_err();
    assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
}
