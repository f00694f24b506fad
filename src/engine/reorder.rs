use std::collections::HashMap;
use std::fmt::Debug;

use ulid::Ulid;

use crate::limits::MAX_BUCKET_ITEMS;
use crate::model::*;

use super::EngineError;

/// An item kept at a dense position inside a bucket.
pub trait OrderedItem {
    type Bucket: Copy + Eq + Debug;

    fn id(&self) -> Ulid;
    fn bucket(&self) -> Self::Bucket;
    fn order_index(&self) -> u32;
    fn place(&mut self, bucket: Self::Bucket, order_index: u32);
}

impl OrderedItem for Service {
    type Bucket = Ulid;

    fn id(&self) -> Ulid {
        self.id
    }
    fn bucket(&self) -> Ulid {
        self.category_id
    }
    fn order_index(&self) -> u32 {
        self.order_index
    }
    fn place(&mut self, bucket: Ulid, order_index: u32) {
        self.category_id = bucket;
        self.order_index = order_index;
    }
}

/// Categories share one root bucket.
impl OrderedItem for Category {
    type Bucket = ();

    fn id(&self) -> Ulid {
        self.id
    }
    fn bucket(&self) {}
    fn order_index(&self) -> u32 {
        self.order_index
    }
    fn place(&mut self, _bucket: (), order_index: u32) {
        self.order_index = order_index;
    }
}

impl OrderedItem for ContentBlock {
    type Bucket = Ulid;

    fn id(&self) -> Ulid {
        self.id
    }
    fn bucket(&self) -> Ulid {
        self.section_id
    }
    fn order_index(&self) -> u32 {
        self.order_index
    }
    fn place(&mut self, bucket: Ulid, order_index: u32) {
        self.section_id = bucket;
        self.order_index = order_index;
    }
}

fn placement<T: OrderedItem>(item: &T, bucket: T::Bucket, order_index: u32) -> Placement<T::Bucket> {
    Placement {
        id: item.id(),
        bucket,
        order_index,
    }
}

/// Every placement that changes when `item_id` moves to `new_index` inside
/// `target` (its own bucket when `None`).
///
/// Same bucket, moving up: `[new, old)` shift +1. Moving down: `(old, new]`
/// shift −1. Across buckets: the source closes its gap (index > old, −1) and
/// the destination opens one (index ≥ new, +1). The caller commits the whole
/// plan as one unit.
pub fn plan_move<'a, T: OrderedItem + 'a>(
    items: impl IntoIterator<Item = &'a T>,
    item_id: Ulid,
    target: Option<T::Bucket>,
    new_index: u32,
) -> Result<Vec<Placement<T::Bucket>>, EngineError> {
    let items: Vec<&T> = items.into_iter().collect();
    let moving = items
        .iter()
        .find(|i| i.id() == item_id)
        .ok_or(EngineError::NotFound(item_id))?;
    let source = moving.bucket();
    let old = moving.order_index();
    let dest = target.unwrap_or(source);
    let others = items.iter().filter(|i| i.id() != item_id);

    let mut plan = Vec::new();
    if dest == source {
        let count = bucket_len(items.iter().copied(), source);
        if new_index as usize >= count {
            return Err(EngineError::validation(format!(
                "index {new_index} out of range for bucket of {count}"
            )));
        }
        if new_index == old {
            return Ok(plan);
        }
        for item in others.filter(|i| i.bucket() == source) {
            let idx = item.order_index();
            if new_index < old && (new_index..old).contains(&idx) {
                plan.push(placement(*item, source, idx + 1));
            } else if new_index > old && idx > old && idx <= new_index {
                plan.push(placement(*item, source, idx - 1));
            }
        }
    } else {
        let count = bucket_len(items.iter().copied(), dest);
        if new_index as usize > count {
            return Err(EngineError::validation(format!(
                "index {new_index} out of range for bucket of {count}"
            )));
        }
        if count >= MAX_BUCKET_ITEMS {
            return Err(EngineError::LimitExceeded("too many items in bucket"));
        }
        for item in others {
            let idx = item.order_index();
            if item.bucket() == source && idx > old {
                plan.push(placement(*item, source, idx - 1));
            } else if item.bucket() == dest && idx >= new_index {
                plan.push(placement(*item, dest, idx + 1));
            }
        }
    }
    plan.push(placement(*moving, dest, new_index));
    Ok(plan)
}

/// Placements that close the gap left by removing `item_id`.
pub fn plan_removal<'a, T: OrderedItem + 'a>(
    items: impl IntoIterator<Item = &'a T>,
    item_id: Ulid,
) -> Result<Vec<Placement<T::Bucket>>, EngineError> {
    let items: Vec<&T> = items.into_iter().collect();
    let removed = items
        .iter()
        .find(|i| i.id() == item_id)
        .ok_or(EngineError::NotFound(item_id))?;
    let (bucket, old) = (removed.bucket(), removed.order_index());
    Ok(items
        .iter()
        .filter(|i| i.bucket() == bucket && i.order_index() > old)
        .map(|i| placement(*i, bucket, i.order_index() - 1))
        .collect())
}

/// Index a new item gets when appended to `bucket`.
pub fn next_index<'a, T: OrderedItem + 'a>(
    items: impl IntoIterator<Item = &'a T>,
    bucket: T::Bucket,
) -> Result<u32, EngineError> {
    let count = bucket_len(items, bucket);
    if count >= MAX_BUCKET_ITEMS {
        return Err(EngineError::LimitExceeded("too many items in bucket"));
    }
    Ok(count as u32)
}

pub fn apply_placements<T: OrderedItem>(items: &mut HashMap<Ulid, T>, placements: &[Placement<T::Bucket>]) {
    for p in placements {
        if let Some(item) = items.get_mut(&p.id) {
            item.place(p.bucket, p.order_index);
        }
    }
}

fn bucket_len<'a, T: OrderedItem + 'a>(items: impl IntoIterator<Item = &'a T>, bucket: T::Bucket) -> usize {
    items.into_iter().filter(|i| i.bucket() == bucket).count()
}

/// Sorted indices of `bucket` equal `0..count`.
pub fn is_dense<'a, T: OrderedItem + 'a>(items: impl IntoIterator<Item = &'a T>, bucket: T::Bucket) -> bool {
    let mut indices: Vec<u32> = items
        .into_iter()
        .filter(|i| i.bucket() == bucket)
        .map(OrderedItem::order_index)
        .collect();
    indices.sort_unstable();
    indices.iter().enumerate().all(|(pos, &idx)| pos as u32 == idx)
}
