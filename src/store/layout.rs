//! # Record Layout
//!
//! The extractor framework that maps typed business fields to byte
//! offsets lives outside this crate; the core needs just enough of it to
//! run the replication merge. A [`RecordLayout`] names the record stride,
//! the primary-key fields (so the merge can tell an update from a true
//! replacement), and the offsets of string-reference fields (so incoming
//! pages can have their master string refs rewritten to local ones).

use smallvec::SmallVec;

use crate::arena::Arena;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Byte,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    /// u32 reference into the interned string pool; 0 is the null string.
    StringRef,
}

impl FieldKind {
    pub fn width(self) -> usize {
        match self {
            FieldKind::Bool | FieldKind::Byte => 1,
            FieldKind::Short | FieldKind::Char => 2,
            FieldKind::Int | FieldKind::Float | FieldKind::StringRef => 4,
            FieldKind::Long | FieldKind::Double => 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub offset: u32,
    pub kind: FieldKind,
}

#[derive(Debug, Clone)]
pub struct RecordLayout {
    stride: usize,
    pk_fields: SmallVec<[Field; 4]>,
    string_fields: SmallVec<[u32; 4]>,
}

impl RecordLayout {
    pub fn new(
        stride: usize,
        pk_fields: impl IntoIterator<Item = Field>,
        string_fields: impl IntoIterator<Item = u32>,
    ) -> Self {
        let pk_fields: SmallVec<[Field; 4]> = pk_fields.into_iter().collect();
        let string_fields: SmallVec<[u32; 4]> = string_fields.into_iter().collect();
        assert!(stride >= 4, "record stride must hold at least the free-list link");
        for f in &pk_fields {
            assert!(
                f.offset as usize + f.kind.width() <= stride,
                "pk field at offset {} exceeds stride {}",
                f.offset,
                stride
            );
        }
        for off in &string_fields {
            assert!(
                *off as usize + 4 <= stride,
                "string field at offset {} exceeds stride {}",
                off,
                stride
            );
        }
        Self {
            stride,
            pk_fields,
            string_fields,
        }
    }

    /// Layout with no pk or string metadata; byte-different incoming
    /// records always bucket as updates.
    pub fn opaque(stride: usize) -> Self {
        Self::new(stride, [], [])
    }

    #[inline]
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn string_field_offsets(&self) -> &[u32] {
        &self.string_fields
    }

    #[inline]
    pub fn has_pk(&self) -> bool {
        !self.pk_fields.is_empty()
    }

    /// Compare the primary key of the record at `a_off` in `a` against
    /// the record at `b_off` in `b`. With no pk fields configured every
    /// record compares equal (byte differences then count as updates).
    pub fn pk_equal(&self, a: &Arena, a_off: usize, b: &Arena, b_off: usize) -> bool {
        for f in &self.pk_fields {
            let off = f.offset as usize;
            let equal = match f.kind.width() {
                1 => a.get_u8(a_off + off) == b.get_u8(b_off + off),
                2 => a.get_u16(a_off + off) == b.get_u16(b_off + off),
                4 => a.get_i32(a_off + off) == b.get_i32(b_off + off),
                _ => a.get_i64(a_off + off) == b.get_i64(b_off + off),
            };
            if !equal {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pk_equality_by_field() {
        let layout = RecordLayout::new(
            16,
            [Field { offset: 0, kind: FieldKind::Int }, Field { offset: 8, kind: FieldKind::Long }],
            [],
        );
        let a = Arena::zeroed(32).unwrap();
        let b = Arena::zeroed(32).unwrap();
        a.put_i32(0, 5);
        a.put_i64(8, 99);
        b.put_i32(16, 5);
        b.put_i64(24, 99);
        assert!(layout.pk_equal(&a, 0, &b, 16));
        b.put_i64(24, 98);
        assert!(!layout.pk_equal(&a, 0, &b, 16));
    }

    #[test]
    fn opaque_layout_always_matches() {
        let layout = RecordLayout::opaque(8);
        let a = Arena::zeroed(8).unwrap();
        let b = Arena::zeroed(8).unwrap();
        b.put_i32(0, 1);
        assert!(layout.pk_equal(&a, 0, &b, 0));
    }

    #[test]
    #[should_panic(expected = "exceeds stride")]
    fn oversized_pk_field_rejected() {
        RecordLayout::new(8, [Field { offset: 4, kind: FieldKind::Long }], []);
    }
}
