//! The contract runtime capability.
//!
//! The ledger core never interprets wasm itself; it hands code, memory pages
//! and globals to a `ContractVm` and persists whatever comes back. Pages are
//! fixed-size; an empty page vector entry means the page is untouched and is
//! not persisted.

/// Errors from contract execution.
#[derive(Clone, Debug, thiserror::Error)]
pub enum VmError {
    #[error("invalid contract module: {0}")]
    InvalidModule(String),
    #[error("out of gas: needed {needed}, budget {budget}")]
    OutOfGas { needed: u64, budget: u64 },
    #[error("contract trapped: {0}")]
    Trap(String),
}

/// Snapshot of a contract instance's mutable state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmState {
    /// Fixed-size memory pages; an empty vec marks an untouched page.
    pub pages: Vec<Vec<u8>>,
    /// Serialized VM globals.
    pub globals: Vec<u8>,
}

impl VmState {
    pub fn num_pages(&self) -> u64 {
        self.pages.len() as u64
    }

    /// Indices of pages with content, ascending.
    pub fn non_empty_pages(&self) -> Vec<u64> {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_empty())
            .map(|(i, _)| i as u64)
            .collect()
    }
}

/// Result of one contract invocation.
#[derive(Clone, Debug)]
pub struct VmOutcome {
    pub state: VmState,
    pub gas_used: u64,
}

/// The contract runtime capability. Any conforming backend can be
/// substituted; the ledger only moves bytes.
pub trait ContractVm: Send + Sync {
    /// Validate `code` and produce the initial instance state.
    fn instantiate(&self, code: &[u8], page_size: usize) -> Result<VmState, VmError>;

    /// Run `entrypoint` against `state`, returning the successor state and
    /// the gas consumed. Must not exceed `gas_budget`.
    fn invoke(
        &self,
        code: &[u8],
        state: &VmState,
        entrypoint: &str,
        payload: &[u8],
        gas_budget: u64,
    ) -> Result<VmOutcome, VmError>;
}

/// Deterministic arithmetic stand-in for a real wasm runtime, used by tests.
///
/// `instantiate` allocates `2 + code.len() % 3` pages and stamps the code
/// digest into page 0. `invoke` folds the entrypoint and payload into the
/// globals; an entrypoint named `trap` traps, and gas is `10 + payload len`.
pub struct HashVm;

impl ContractVm for HashVm {
    fn instantiate(&self, code: &[u8], page_size: usize) -> Result<VmState, VmError> {
        if code.is_empty() {
            return Err(VmError::InvalidModule("empty module".into()));
        }

        let num_pages = 2 + code.len() % 3;
        let mut pages = vec![Vec::new(); num_pages];
        let mut first = vec![0u8; page_size];
        let digest = crate::hash_domain(b"cascade.vm.page", code);
        first[..32.min(page_size)].copy_from_slice(&digest[..32.min(page_size)]);
        pages[0] = first;

        Ok(VmState {
            pages,
            globals: digest[..8].to_vec(),
        })
    }

    fn invoke(
        &self,
        code: &[u8],
        state: &VmState,
        entrypoint: &str,
        payload: &[u8],
        gas_budget: u64,
    ) -> Result<VmOutcome, VmError> {
        if entrypoint == "trap" {
            return Err(VmError::Trap("explicit trap entrypoint".into()));
        }

        let gas_used = 10 + payload.len() as u64;
        if gas_used > gas_budget {
            return Err(VmError::OutOfGas {
                needed: gas_used,
                budget: gas_budget,
            });
        }

        let mut next = state.clone();
        next.globals = crate::hash_concat(&[
            &state.globals,
            code,
            entrypoint.as_bytes(),
            payload,
        ])[..8]
            .to_vec();

        Ok(VmOutcome {
            state: next,
            gas_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instantiate_is_deterministic() {
        let vm = HashVm;
        let a = vm.instantiate(b"module", 64).unwrap();
        let b = vm.instantiate(b"module", 64).unwrap();
        assert_eq!(a, b);
        assert!(!a.pages.is_empty());
        assert_eq!(a.non_empty_pages(), vec![0]);
    }

    #[test]
    fn empty_module_rejected() {
        assert!(matches!(
            HashVm.instantiate(b"", 64),
            Err(VmError::InvalidModule(_))
        ));
    }

    #[test]
    fn invoke_advances_globals_and_meters_gas() {
        let vm = HashVm;
        let state = vm.instantiate(b"module", 64).unwrap();

        let outcome = vm.invoke(b"module", &state, "run", b"xy", 100).unwrap();
        assert_eq!(outcome.gas_used, 12);
        assert_ne!(outcome.state.globals, state.globals);

        assert!(matches!(
            vm.invoke(b"module", &state, "run", b"xy", 5),
            Err(VmError::OutOfGas { needed: 12, budget: 5 })
        ));
        assert!(matches!(
            vm.invoke(b"module", &state, "trap", b"", 100),
            Err(VmError::Trap(_))
        ));
    }
}
