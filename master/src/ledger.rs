use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Contador de fallos por chunk y regla de reintentos acotados.
///
/// Las entradas se crean con el primer fallo; ausencia = cero fallos.
/// Un contador nunca decrece.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryLedger {
    max_retries: u32,
    failures: BTreeMap<usize, u32>,
}

impl RetryLedger {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            failures: BTreeMap::new(),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn record_failure(&mut self, index: usize) -> u32 {
        let count = self.failures.entry(index).or_insert(0);
        *count += 1;
        *count
    }

    pub fn failures(&self, index: usize) -> u32 {
        self.failures.get(&index).copied().unwrap_or(0)
    }

    /// Se reintenta mientras los fallos sean menos que `max_retries`:
    /// con 2, el segundo fallo agota el presupuesto.
    pub fn should_retry(&self, index: usize) -> bool {
        self.failures(index) < self.max_retries
    }

    /// Reintentos ya consumidos por todos los chunks.
    pub fn total_retries(&self) -> u32 {
        self.failures.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sin_fallos_siempre_reintenta() {
        let ledger = RetryLedger::new(2);
        assert_eq!(ledger.failures(7), 0);
        assert!(ledger.should_retry(7));
    }

    #[test]
    fn segundo_fallo_agota_el_presupuesto() {
        let mut ledger = RetryLedger::new(2);

        assert_eq!(ledger.record_failure(1), 1);
        assert!(ledger.should_retry(1));
        assert_eq!(ledger.record_failure(1), 2);
        assert!(!ledger.should_retry(1));

        // los otros chunks no se ven afectados
        assert!(ledger.should_retry(0));
        assert_eq!(ledger.total_retries(), 2);
    }

    #[test]
    fn sin_reintentos_el_primer_fallo_agota() {
        let mut ledger = RetryLedger::new(0);
        ledger.record_failure(0);
        assert!(!ledger.should_retry(0));
    }
}
