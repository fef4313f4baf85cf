use crate::ins::InsId;
use strum::EnumCount;

/// A table mapping instruction identities to handlers of type `H`.
///
/// Tables are filled once while the CPU is being set up and only read afterwards.
#[derive(Clone)]
pub struct HandlerTable<H> {
    handlers: Box<[Option<H>]>,
}

impl<H> Default for HandlerTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> HandlerTable<H> {
    pub fn new() -> Self {
        Self {
            handlers: std::iter::repeat_with(|| None)
                .take(InsId::COUNT)
                .collect(),
        }
    }

    /// Registers the handler for `id`, returning the previous one.
    pub fn register(&mut self, id: InsId, handler: H) -> Option<H> {
        self.handlers[id as usize].replace(handler)
    }

    #[inline(always)]
    pub fn get(&self, id: InsId) -> Option<&H> {
        self.handlers[id as usize].as_ref()
    }

    /// Iterates over the identities that have no handler.
    pub fn missing(&self) -> impl Iterator<Item = InsId> + '_ {
        use strum::VariantArray;
        InsId::VARIANTS
            .iter()
            .copied()
            .filter(|&id| id != InsId::Invalid && self.get(id).is_none())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut table = HandlerTable::<u32>::new();
        assert!(table.get(InsId::Add).is_none());
        assert_eq!(table.register(InsId::Add, 1), None);
        assert_eq!(table.register(InsId::Add, 2), Some(1));
        assert_eq!(table.get(InsId::Add), Some(&2));
        assert!(table.get(InsId::Addi).is_none());

        assert!(table.missing().any(|id| id == InsId::Addi));
        assert!(!table.missing().any(|id| id == InsId::Add));
        assert!(!table.missing().any(|id| id == InsId::Invalid));
    }
}
