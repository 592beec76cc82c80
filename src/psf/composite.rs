use super::record_id::INVALID_ADDRESS;

/// One predicate's slot in a [`CompositeKey`].
///
/// `previous_address` links to the previous log record whose slot with the
/// same ordinal holds the same key, forming a newest-first chain. The link
/// flags are only meaningful while a single update is being applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPointer {
    pub ordinal: u8,
    pub key: Option<Vec<u8>>,
    pub previous_address: u64,
    pub is_unlink_old: bool,
    pub is_link_new: bool,
}

impl KeyPointer {
    pub fn new(ordinal: u8, key: Option<Vec<u8>>) -> Self {
        Self {
            ordinal,
            key,
            previous_address: INVALID_ADDRESS,
            is_unlink_old: false,
            is_link_new: false,
        }
    }

    pub fn is_null(&self) -> bool {
        self.key.is_none()
    }

    /// Hash-index key of the chain this pointer belongs to, if any.
    pub fn chain_key(&self) -> Option<Vec<u8>> {
        self.key.as_deref().map(|key| chain_key(self.ordinal, key))
    }
}

/// Hash-index key for the chain of `(ordinal, key)`.
pub fn chain_key(ordinal: u8, key: &[u8]) -> Vec<u8> {
    let mut chain = Vec::with_capacity(key.len() + 1);
    chain.push(ordinal);
    chain.extend_from_slice(key);
    chain
}

/// The physical secondary-store key of a predicate group: one slot per predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeKey {
    pub pointers: Vec<KeyPointer>,
}

impl CompositeKey {
    /// Build a key from predicate outputs given in ordinal order.
    pub fn from_outputs(outputs: Vec<Option<Vec<u8>>>) -> Self {
        let pointers = outputs
            .into_iter()
            .enumerate()
            .map(|(ordinal, key)| KeyPointer::new(ordinal as u8, key))
            .collect();
        Self { pointers }
    }

    pub fn any_match(&self) -> bool {
        self.pointers.iter().any(|kp| !kp.is_null())
    }

    pub fn pointer(&self, ordinal: u8) -> Option<&KeyPointer> {
        self.pointers.get(ordinal as usize)
    }

    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    /// Copy of this key keeping only the slots selected by `keep`; the rest become null.
    pub fn retain(&self, keep: impl Fn(&KeyPointer) -> bool) -> Self {
        let pointers = self
            .pointers
            .iter()
            .map(|kp| {
                if keep(kp) {
                    KeyPointer::new(kp.ordinal, kp.key.clone())
                } else {
                    KeyPointer::new(kp.ordinal, None)
                }
            })
            .collect();
        Self { pointers }
    }
}
