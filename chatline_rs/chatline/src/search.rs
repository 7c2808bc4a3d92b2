/// Index of the element that is `<= seek` and closest to it.
pub fn nearest_floor(values: &[f64], seek: f64) -> Option<usize> {
    if values.is_empty() {
        return None;
    }
    let mut lo = 0usize;
    let mut hi = values.len() - 1;
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        if values[mid] < seek {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    if values[hi] > seek {
        return Some(lo);
    }
    if (values[hi] - seek).abs() > (values[lo] - seek).abs() {
        Some(lo)
    } else {
        Some(hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slice_has_no_index() {
        assert_eq!(nearest_floor(&[], 3.0), None);
    }

    #[test]
    fn single_element_always_zero() {
        assert_eq!(nearest_floor(&[5.0], -10.0), Some(0));
        assert_eq!(nearest_floor(&[5.0], 5.0), Some(0));
        assert_eq!(nearest_floor(&[5.0], 50.0), Some(0));
    }

    #[test]
    fn clamps_at_both_ends() {
        let values = [1.0, 2.0, 4.0, 8.0, 16.0];
        assert_eq!(nearest_floor(&values, 0.0), Some(0));
        assert_eq!(nearest_floor(&values, 1.0), Some(0));
        assert_eq!(nearest_floor(&values, 16.0), Some(4));
        assert_eq!(nearest_floor(&values, 99.0), Some(4));
    }

    #[test]
    fn returns_floor_between_elements() {
        let values = [0.0, 10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(nearest_floor(&values, 14.0), Some(1));
        assert_eq!(nearest_floor(&values, 19.9), Some(1));
        assert_eq!(nearest_floor(&values, 20.0), Some(2));
        assert_eq!(nearest_floor(&values, 45.0), Some(4));
    }

    #[test]
    fn exact_hits_on_every_element() {
        let values: Vec<f64> = (0..37).map(|i| (i * 3) as f64).collect();
        for (i, v) in values.iter().enumerate() {
            assert_eq!(nearest_floor(&values, *v), Some(i));
        }
    }

    #[test]
    fn never_returns_an_element_above_seek_inside_range() {
        let values: Vec<f64> = (0..100).map(|i| (i as f64).powf(1.3)).collect();
        let mut seek = values[0];
        while seek < values[values.len() - 1] {
            let idx = nearest_floor(&values, seek).unwrap();
            assert!(values[idx] <= seek);
            assert!(idx + 1 == values.len() || values[idx + 1] > seek);
            seek += 0.77;
        }
    }
}
