use crate::CoreError;

/// Moves the elements at `idx` to the end of `src`, preserving the relative
/// order of both the remaining and the moved elements.
///
/// # Errors
/// Returns [`CoreError::IndexOutOfBounds`] or [`CoreError::DuplicateIndex`]
/// for invalid indices. `src` is left untouched in that case.
pub fn move_idx_to_end<T>(src: &mut Vec<T>, idx: &[usize]) -> Result<(), CoreError> {
    move_idx_to_end_inner(src, idx, None::<fn(&T) -> u8>)
}

/// Like [`move_idx_to_end`], but orders the moved block ascending by
/// `sorting_key`. Elements with equal keys keep their relative order.
///
/// # Errors
/// See [`move_idx_to_end`].
pub fn move_idx_to_end_by_key<T, K, F>(
    src: &mut Vec<T>,
    idx: &[usize],
    sorting_key: F,
) -> Result<(), CoreError>
where
    K: Ord,
    F: FnMut(&T) -> K,
{
    move_idx_to_end_inner(src, idx, Some(sorting_key))
}

fn move_idx_to_end_inner<T, K, F>(
    src: &mut Vec<T>,
    idx: &[usize],
    sorting_key: Option<F>,
) -> Result<(), CoreError>
where
    K: Ord,
    F: FnMut(&T) -> K,
{
    if idx.is_empty() {
        return Ok(());
    }

    let len = src.len();
    let mut selected = vec![false; len];
    for &index in idx {
        if index >= len {
            return Err(CoreError::IndexOutOfBounds { index, len });
        }
        if selected[index] {
            return Err(CoreError::DuplicateIndex(index));
        }
        selected[index] = true;
    }

    let mut kept = Vec::with_capacity(len - idx.len());
    let mut moved = Vec::with_capacity(idx.len());
    for (position, element) in std::mem::take(src).into_iter().enumerate() {
        if selected[position] {
            moved.push(element);
        } else {
            kept.push(element);
        }
    }

    if let Some(key) = sorting_key {
        moved.sort_by_key(key);
    }

    kept.extend(moved);
    *src = kept;
    Ok(())
}

/// Separately counts the `true` and `false` values of an iterator.
pub fn count_true_false(values: impl IntoIterator<Item = bool>) -> (usize, usize) {
    values
        .into_iter()
        .fold((0, 0), |(truthy, falsy), value| {
            if value {
                (truthy + 1, falsy)
            } else {
                (truthy, falsy + 1)
            }
        })
}
