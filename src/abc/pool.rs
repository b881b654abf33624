//! Constant-pool builder.
//!
//! ABC constant pools are 1-based with index 0 reserved ("any"/empty).
//! Every entry is interned so repeated lookups return the same index.

use std::collections::HashMap;

use swf::avm2::types::{ConstantPool, Index, Multiname, Namespace};

pub struct PoolBuilder {
    pool: ConstantPool,
    strings: HashMap<Vec<u8>, u32>,
    ints: HashMap<i32, u32>,
    doubles: HashMap<u64, u32>,
    /// Package namespaces keyed by the package name's string index.
    packages: HashMap<u32, u32>,
    /// QNames keyed by (namespace index, name string index).
    qnames: HashMap<(u32, u32), u32>,
    /// The late-bound `MultinameL([public ""])`, created on first use.
    late: Option<u32>,
}

impl PoolBuilder {
    pub fn new() -> Self {
        PoolBuilder {
            pool: ConstantPool {
                ints: Vec::new(),
                uints: Vec::new(),
                doubles: Vec::new(),
                strings: Vec::new(),
                namespaces: Vec::new(),
                namespace_sets: Vec::new(),
                multinames: Vec::new(),
            },
            strings: HashMap::new(),
            ints: HashMap::new(),
            doubles: HashMap::new(),
            packages: HashMap::new(),
            qnames: HashMap::new(),
            late: None,
        }
    }

    pub fn string(&mut self, s: &str) -> Index<String> {
        let bytes = s.as_bytes().to_vec();
        if let Some(&idx) = self.strings.get(&bytes) {
            return Index::new(idx);
        }
        self.pool.strings.push(bytes.clone());
        let idx = self.pool.strings.len() as u32;
        self.strings.insert(bytes, idx);
        Index::new(idx)
    }

    pub fn int(&mut self, value: i32) -> Index<i32> {
        if let Some(&idx) = self.ints.get(&value) {
            return Index::new(idx);
        }
        self.pool.ints.push(value);
        let idx = self.pool.ints.len() as u32;
        self.ints.insert(value, idx);
        Index::new(idx)
    }

    /// Intern a double. NaN never lands in the pool: the emitter uses the
    /// dedicated pushnan opcode instead, because the double pool cannot
    /// distinguish NaN payloads safely.
    pub fn double(&mut self, value: f64) -> Index<f64> {
        let bits = value.to_bits();
        if let Some(&idx) = self.doubles.get(&bits) {
            return Index::new(idx);
        }
        self.pool.doubles.push(value);
        let idx = self.pool.doubles.len() as u32;
        self.doubles.insert(bits, idx);
        Index::new(idx)
    }

    /// Intern a package namespace (`""` is the public namespace).
    pub fn package(&mut self, name: &str) -> Index<Namespace> {
        let name_idx = self.string(name).0;
        if let Some(&idx) = self.packages.get(&name_idx) {
            return Index::new(idx);
        }
        self.pool
            .namespaces
            .push(Namespace::Package(Index::new(name_idx)));
        let idx = self.pool.namespaces.len() as u32;
        self.packages.insert(name_idx, idx);
        Index::new(idx)
    }

    /// Intern a QName in the given package.
    pub fn qname(&mut self, package: &str, name: &str) -> Index<Multiname> {
        let ns = self.package(package).0;
        let name_idx = self.string(name).0;
        if let Some(&idx) = self.qnames.get(&(ns, name_idx)) {
            return Index::new(idx);
        }
        self.pool.multinames.push(Multiname::QName {
            namespace: Index::new(ns),
            name: Index::new(name_idx),
        });
        let idx = self.pool.multinames.len() as u32;
        self.qnames.insert((ns, name_idx), idx);
        Index::new(idx)
    }

    /// Intern a public (top-level package) QName.
    pub fn member(&mut self, name: &str) -> Index<Multiname> {
        self.qname("", name)
    }

    /// The late-bound multiname used for runtime-indexed property access
    /// (function-table lookups): `MultinameL` over the public namespace set.
    pub fn late_name(&mut self) -> Index<Multiname> {
        if let Some(idx) = self.late {
            return Index::new(idx);
        }
        let ns = self.package("");
        self.pool.namespace_sets.push(vec![ns]);
        let set = Index::new(self.pool.namespace_sets.len() as u32);
        self.pool
            .multinames
            .push(Multiname::MultinameL { namespace_set: set });
        let idx = self.pool.multinames.len() as u32;
        self.late = Some(idx);
        Index::new(idx)
    }

    pub fn finish(self) -> ConstantPool {
        self.pool
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interns_strings_once() {
        let mut pool = PoolBuilder::new();
        let a = pool.string("wasm$memory");
        let b = pool.string("wasm$memory");
        let c = pool.string("wasm$table");
        assert_eq!(a.0, b.0);
        assert_ne!(a.0, c.0);
        assert_eq!(a.0, 1, "pool indices are 1-based");

        let done = pool.finish();
        assert_eq!(done.strings.len(), 2);
        assert_eq!(done.strings[0], b"wasm$memory");
    }

    #[test]
    fn interns_qnames_by_namespace_and_name() {
        let mut pool = PoolBuilder::new();
        let a = pool.member("func$f0");
        let b = pool.member("func$f0");
        let c = pool.qname("flash.utils", "ByteArray");
        assert_eq!(a.0, b.0);
        assert_ne!(a.0, c.0);

        let done = pool.finish();
        assert_eq!(done.multinames.len(), 2);
        assert_eq!(done.namespaces.len(), 2);
    }

    #[test]
    fn late_name_is_singular() {
        let mut pool = PoolBuilder::new();
        let a = pool.late_name();
        let b = pool.late_name();
        assert_eq!(a.0, b.0);
        let done = pool.finish();
        assert_eq!(done.namespace_sets.len(), 1);
        assert!(matches!(
            done.multinames[(a.0 - 1) as usize],
            Multiname::MultinameL { .. }
        ));
    }

    #[test]
    fn doubles_keyed_by_bits() {
        let mut pool = PoolBuilder::new();
        let a = pool.double(1.5);
        let b = pool.double(1.5);
        let c = pool.double(-1.5);
        assert_eq!(a.0, b.0);
        assert_ne!(a.0, c.0);
        let zero = pool.double(0.0);
        let neg_zero = pool.double(-0.0);
        assert_ne!(zero.0, neg_zero.0, "negative zero is a distinct constant");
    }
}
