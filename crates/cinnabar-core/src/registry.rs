//! Execution-provider dispatch: the opset-versioned kernel registry.
//!
//! A registration key is (operator name, domain, opset range, backend, type
//! constraints per typed input slot). Selection iterates backends in the
//! configured preference order; within a backend the registration with the
//! narrowest opset range containing the requested version wins, which keeps
//! a newer, more specific kernel from being shadowed by an older catch-all.

use crate::graph::Node;
use crate::kernel::Kernel;
use crate::types::DataType;
use crate::{Error, Result};
use std::collections::HashMap;

/// A backend (execution provider) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Generic and vectorized CPU execution.
    Cpu,
    /// GPU execution through generated compute shaders.
    Wgpu,
}

impl BackendKind {
    /// Parse a provider name as used by `AppendExecutionProvider`.
    pub fn from_provider_name(name: &str) -> Option<Self> {
        match name {
            "cpu" => Some(BackendKind::Cpu),
            "wgpu" | "webgpu" => Some(BackendKind::Wgpu),
            _ => None,
        }
    }
}

/// Inclusive opset version range `[since, until]`; `until = None` is
/// open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpsetRange {
    pub since: i64,
    pub until: Option<i64>,
}

impl OpsetRange {
    /// A range covering `[since, ∞)`.
    pub fn since(since: i64) -> Self {
        Self { since, until: None }
    }

    /// A closed range `[since, until]`.
    pub fn versioned(since: i64, until: i64) -> Self {
        Self {
            since,
            until: Some(until),
        }
    }

    /// Whether the range contains an opset version.
    pub fn contains(&self, version: i64) -> bool {
        version >= self.since && self.until.is_none_or(|until| version <= until)
    }

    /// Range width used for narrowest-match selection; open-ended ranges are
    /// the widest possible.
    fn width(&self) -> u64 {
        match self.until {
            Some(until) => (until - self.since).max(0) as u64,
            None => u64::MAX,
        }
    }

    /// Whether two ranges share at least one version.
    fn overlaps(&self, other: &OpsetRange) -> bool {
        let self_end = self.until.unwrap_or(i64::MAX);
        let other_end = other.until.unwrap_or(i64::MAX);
        self.since <= other_end && other.since <= self_end
    }
}

/// Constructor invoked once per node at session-load time.
pub type KernelFactory = Box<dyn Fn(&Node) -> Result<Box<dyn Kernel>> + Send + Sync>;

/// One kernel registration.
pub struct KernelDef {
    op_type: String,
    domain: String,
    backend: BackendKind,
    opset: OpsetRange,
    /// Allowed element types per input slot; `None` leaves a slot
    /// unconstrained, and slots beyond the list are unconstrained.
    input_types: Vec<Option<Vec<DataType>>>,
    factory: KernelFactory,
}

impl KernelDef {
    /// Start building a registration for an operator in the default domain.
    pub fn builder(op_type: impl Into<String>) -> KernelDefBuilder {
        KernelDefBuilder {
            op_type: op_type.into(),
            domain: String::new(),
            backend: BackendKind::Cpu,
            opset: OpsetRange::since(1),
            input_types: Vec::new(),
        }
    }

    /// The operator name this registration serves.
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// The backend this registration serves.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Construct the kernel for a node. Construction must be side-effect-free
    /// with respect to tensor data.
    pub fn create(&self, node: &Node) -> Result<Box<dyn Kernel>> {
        (self.factory)(node)
    }

    /// Check the concrete input-type assignment against the constraints.
    /// Absent optional inputs (`None`) always pass.
    fn matches_types(&self, input_types: &[Option<DataType>]) -> bool {
        for (slot, dtype) in input_types.iter().enumerate() {
            let Some(dtype) = dtype else { continue };
            if let Some(Some(allowed)) = self.input_types.get(slot) {
                if !allowed.contains(dtype) {
                    return false;
                }
            }
        }
        true
    }

    /// Whether some concrete type assignment could satisfy both
    /// registrations' constraints.
    fn types_intersect(&self, other: &KernelDef) -> bool {
        let slots = self.input_types.len().max(other.input_types.len());
        for slot in 0..slots {
            let a = self.input_types.get(slot).and_then(|c| c.as_ref());
            let b = other.input_types.get(slot).and_then(|c| c.as_ref());
            if let (Some(a), Some(b)) = (a, b) {
                if !a.iter().any(|t| b.contains(t)) {
                    return false;
                }
            }
        }
        true
    }
}

impl std::fmt::Debug for KernelDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelDef")
            .field("op_type", &self.op_type)
            .field("domain", &self.domain)
            .field("backend", &self.backend)
            .field("opset", &self.opset)
            .finish()
    }
}

/// Builder for [`KernelDef`], mirroring the registration blocks the CPU and
/// GPU providers declare per operator version.
pub struct KernelDefBuilder {
    op_type: String,
    domain: String,
    backend: BackendKind,
    opset: OpsetRange,
    input_types: Vec<Option<Vec<DataType>>>,
}

impl KernelDefBuilder {
    /// Set the operator domain ("" is the default domain).
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set the backend this kernel runs on.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Register for `[since, ∞)`.
    pub fn since(mut self, since: i64) -> Self {
        self.opset = OpsetRange::since(since);
        self
    }

    /// Register for the closed range `[since, until]`.
    pub fn versioned(mut self, since: i64, until: i64) -> Self {
        self.opset = OpsetRange::versioned(since, until);
        self
    }

    /// Constrain input slot `slot` to the given element types.
    pub fn type_constraint(mut self, slot: usize, types: &[DataType]) -> Self {
        if self.input_types.len() <= slot {
            self.input_types.resize(slot + 1, None);
        }
        self.input_types[slot] = Some(types.to_vec());
        self
    }

    /// Finish the registration with its kernel constructor.
    pub fn build<F>(self, factory: F) -> KernelDef
    where
        F: Fn(&Node) -> Result<Box<dyn Kernel>> + Send + Sync + 'static,
    {
        KernelDef {
            op_type: self.op_type,
            domain: self.domain,
            backend: self.backend,
            opset: self.opset,
            input_types: self.input_types,
            factory: Box::new(factory),
        }
    }
}

type RegistryKey = (String, String, BackendKind);

/// Registry mapping (operator, domain, backend) to versioned kernel
/// registrations, built once at session-load time.
pub struct KernelRegistry {
    defs: HashMap<RegistryKey, Vec<KernelDef>>,
}

impl KernelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            defs: HashMap::new(),
        }
    }

    /// Register a kernel definition.
    ///
    /// # Errors
    /// `InvalidArgument` when the registration is ambiguous against an
    /// existing one: same (operator, domain, backend), opset ranges that
    /// overlap without one being strictly narrower, and type constraints
    /// that share at least one concrete assignment. Narrower-inside-wider
    /// overlaps are allowed; the narrowest range wins at resolution.
    pub fn register(&mut self, def: KernelDef) -> Result<()> {
        let key = (
            def.op_type.clone(),
            def.domain.clone(),
            def.backend,
        );
        let entries = self.defs.entry(key).or_default();
        for existing in entries.iter() {
            if existing.opset.overlaps(&def.opset)
                && existing.opset.width() == def.opset.width()
                && existing.types_intersect(&def)
            {
                return Err(Error::InvalidArgument(format!(
                    "ambiguous kernel registration for '{}' (domain '{}', {:?}): \
                     {:?} conflicts with {:?}",
                    def.op_type, def.domain, def.backend, def.opset, existing.opset
                )));
            }
        }
        entries.push(def);
        Ok(())
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        self.defs.values().map(Vec::len).sum()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Select the single best-matching kernel registration.
    ///
    /// Backends are tried in preference order; within a backend, every
    /// candidate must contain the requested opset version and satisfy the
    /// concrete input-type assignment, and the narrowest opset range wins.
    ///
    /// # Errors
    /// `KernelNotFound` when no enabled backend yields a match.
    pub fn resolve(
        &self,
        op_type: &str,
        domain: &str,
        opset: i64,
        input_types: &[Option<DataType>],
        backends: &[BackendKind],
    ) -> Result<&KernelDef> {
        for backend in backends {
            let key = (op_type.to_string(), domain.to_string(), *backend);
            let Some(entries) = self.defs.get(&key) else {
                continue;
            };
            let best = entries
                .iter()
                .filter(|def| def.opset.contains(opset) && def.matches_types(input_types))
                .min_by_key(|def| def.opset.width());
            if let Some(def) = best {
                tracing::trace!(
                    op = op_type,
                    ?backend,
                    opset,
                    range = ?def.opset,
                    "resolved kernel"
                );
                return Ok(def);
            }
        }
        Err(Error::KernelNotFound(format!(
            "no kernel for '{}' (domain '{}', opset {}) on backends {:?} with input types {:?}",
            op_type, domain, opset, backends, input_types
        )))
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelContext;

    struct NopKernel;
    impl Kernel for NopKernel {
        fn compute(&self, _ctx: &mut KernelContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn nop_factory(_node: &Node) -> Result<Box<dyn Kernel>> {
        Ok(Box::new(NopKernel))
    }

    #[test]
    fn test_narrowest_range_wins_over_catch_all() {
        let mut registry = KernelRegistry::new();
        registry
            .register(
                KernelDef::builder("MaxPool")
                    .versioned(1, 10)
                    .build(nop_factory),
            )
            .unwrap();
        registry
            .register(KernelDef::builder("MaxPool").since(11).build(nop_factory))
            .unwrap();

        // Opset 11 must select the [11, ∞) registration.
        let def = registry
            .resolve("MaxPool", "", 11, &[], &[BackendKind::Cpu])
            .unwrap();
        assert_eq!(def.opset, OpsetRange::since(11));

        let def = registry
            .resolve("MaxPool", "", 7, &[], &[BackendKind::Cpu])
            .unwrap();
        assert_eq!(def.opset, OpsetRange::versioned(1, 10));
    }

    #[test]
    fn test_specific_range_beats_overlapping_catch_all() {
        let mut registry = KernelRegistry::new();
        registry
            .register(KernelDef::builder("AveragePool").since(7).build(nop_factory))
            .unwrap();
        registry
            .register(
                KernelDef::builder("AveragePool")
                    .versioned(19, 21)
                    .build(nop_factory),
            )
            .unwrap();

        let def = registry
            .resolve("AveragePool", "", 20, &[], &[BackendKind::Cpu])
            .unwrap();
        assert_eq!(def.opset, OpsetRange::versioned(19, 21));
    }

    #[test]
    fn test_version_out_of_range() {
        let mut registry = KernelRegistry::new();
        registry
            .register(
                KernelDef::builder("LpPool")
                    .versioned(2, 17)
                    .build(nop_factory),
            )
            .unwrap();

        let err = registry
            .resolve("LpPool", "", 18, &[], &[BackendKind::Cpu])
            .unwrap_err();
        assert!(matches!(err, Error::KernelNotFound(_)));
    }

    #[test]
    fn test_type_constraints_filter_candidates() {
        let mut registry = KernelRegistry::new();
        registry
            .register(
                KernelDef::builder("MaxPool")
                    .since(12)
                    .type_constraint(0, &[DataType::F32, DataType::F64])
                    .build(nop_factory),
            )
            .unwrap();

        assert!(registry
            .resolve(
                "MaxPool",
                "",
                12,
                &[Some(DataType::F32)],
                &[BackendKind::Cpu]
            )
            .is_ok());
        assert!(registry
            .resolve(
                "MaxPool",
                "",
                12,
                &[Some(DataType::I32)],
                &[BackendKind::Cpu]
            )
            .is_err());
        // Absent optional inputs always pass constraint checks.
        assert!(registry
            .resolve("MaxPool", "", 12, &[None], &[BackendKind::Cpu])
            .is_ok());
    }

    #[test]
    fn test_backend_preference_order() {
        let mut registry = KernelRegistry::new();
        registry
            .register(
                KernelDef::builder("LayerNormalization")
                    .since(17)
                    .backend(BackendKind::Cpu)
                    .build(nop_factory),
            )
            .unwrap();
        registry
            .register(
                KernelDef::builder("LayerNormalization")
                    .since(17)
                    .backend(BackendKind::Wgpu)
                    .build(nop_factory),
            )
            .unwrap();

        let def = registry
            .resolve(
                "LayerNormalization",
                "",
                17,
                &[],
                &[BackendKind::Wgpu, BackendKind::Cpu],
            )
            .unwrap();
        assert_eq!(def.backend(), BackendKind::Wgpu);

        let def = registry
            .resolve(
                "LayerNormalization",
                "",
                17,
                &[],
                &[BackendKind::Cpu, BackendKind::Wgpu],
            )
            .unwrap();
        assert_eq!(def.backend(), BackendKind::Cpu);
    }

    #[test]
    fn test_ambiguous_registration_rejected() {
        let mut registry = KernelRegistry::new();
        registry
            .register(
                KernelDef::builder("MaxPool")
                    .versioned(8, 11)
                    .type_constraint(0, &[DataType::F32])
                    .build(nop_factory),
            )
            .unwrap();

        // Same range, intersecting types: rejected at registration time.
        let err = registry
            .register(
                KernelDef::builder("MaxPool")
                    .versioned(8, 11)
                    .type_constraint(0, &[DataType::F32, DataType::U8])
                    .build(nop_factory),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // Same range but disjoint types: fine.
        registry
            .register(
                KernelDef::builder("MaxPool")
                    .versioned(8, 11)
                    .type_constraint(0, &[DataType::I8])
                    .build(nop_factory),
            )
            .unwrap();
    }

    #[test]
    fn test_domain_is_part_of_the_key() {
        let mut registry = KernelRegistry::new();
        registry
            .register(
                KernelDef::builder("SimplifiedLayerNormalization")
                    .since(1)
                    .build(nop_factory),
            )
            .unwrap();

        assert!(registry
            .resolve(
                "SimplifiedLayerNormalization",
                "com.example",
                1,
                &[],
                &[BackendKind::Cpu]
            )
            .is_err());
        assert!(registry
            .resolve(
                "SimplifiedLayerNormalization",
                "",
                1,
                &[],
                &[BackendKind::Cpu]
            )
            .is_ok());
    }
}
