use crate::firestore::core::types::TargetId;

const RESERVED_BITS: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GeneratorId {
    TargetCache = 0,
    SyncEngine = 1,
}

/// Hands out target ids in disjoint sequences: even ids for targets stored in
/// the target cache, odd ids for the sync engine's limbo targets.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    generator_id: GeneratorId,
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Listen targets. Continues after `highest_target_id`, the largest id
    /// found in the target cache.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        let mut generator = Self::new(GeneratorId::TargetCache);
        generator.seek_after(highest_target_id);
        generator
    }

    /// Limbo resolution targets. These are never persisted.
    pub fn for_sync_engine() -> Self {
        Self::new(GeneratorId::SyncEngine)
    }

    fn new(generator_id: GeneratorId) -> Self {
        Self {
            generator_id,
            next_id: generator_id as TargetId,
        }
    }

    fn seek_after(&mut self, target_id: TargetId) {
        let candidate = (target_id & !((1 << RESERVED_BITS) - 1)) | self.generator_id as TargetId;
        self.next_id = if candidate > target_id {
            candidate
        } else {
            candidate + (1 << RESERVED_BITS)
        };
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 1 << RESERVED_BITS;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_do_not_overlap() {
        let mut cache = TargetIdGenerator::for_target_cache(0);
        let mut sync = TargetIdGenerator::for_sync_engine();
        assert_eq!([cache.next(), cache.next(), cache.next()], [2, 4, 6]);
        assert_eq!([sync.next(), sync.next(), sync.next()], [1, 3, 5]);
    }

    #[test]
    fn resumes_after_highest_cached_id() {
        assert_eq!(TargetIdGenerator::for_target_cache(4).next(), 6);
        assert_eq!(TargetIdGenerator::for_target_cache(5).next(), 6);
        assert_eq!(TargetIdGenerator::for_target_cache(7).next(), 8);
    }
}
