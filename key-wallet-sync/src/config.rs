//! Configuration for the wallet synchronization engine.

use std::time::Duration;

use dashcore::Network;

/// Tunables governing address discovery, scan batching and balance checks.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Network the wallet operates on. Decides address encoding and the
    /// BIP44 coin type used for derivation paths.
    pub network: Network,

    /// Number of consecutive unused addresses that terminates discovery on
    /// one chain (the BIP44 gap limit).
    pub address_scan_gap_limit: u32,

    /// Hard ceiling on addresses examined per chain in a single scan,
    /// regardless of gap-limit progress.
    pub max_addresses_to_scan: u32,

    /// Hard ceiling on account indexes examined during account discovery.
    pub max_bip44_accounts: u32,

    /// Number of addresses queried against the chain backend per batch.
    /// Interrupt requests are honored between batches.
    pub scan_batch_size: u32,

    /// Minimum interval between network cross-checks of a cached address
    /// balance.
    pub balance_check_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            network: Network::Dash,
            address_scan_gap_limit: 20,
            max_addresses_to_scan: 1000,
            max_bip44_accounts: 200,
            scan_batch_size: 10,
            balance_check_interval: Duration::from_secs(1800),
        }
    }
}

impl SyncConfig {
    /// Creates a configuration with default tunables for the given network.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    /// Creates a configuration for Dash mainnet.
    pub fn mainnet() -> Self {
        Self::new(Network::Dash)
    }

    /// Creates a configuration for Dash testnet.
    pub fn testnet() -> Self {
        Self::new(Network::Testnet)
    }

    /// Sets the gap limit.
    pub fn with_gap_limit(mut self, gap_limit: u32) -> Self {
        self.address_scan_gap_limit = gap_limit;
        self
    }

    /// Sets the per-batch address count.
    pub fn with_scan_batch_size(mut self, batch_size: u32) -> Self {
        self.scan_batch_size = batch_size;
        self
    }

    /// Sets the per-chain address ceiling.
    pub fn with_max_addresses_to_scan(mut self, max: u32) -> Self {
        self.max_addresses_to_scan = max;
        self
    }

    /// Sets the account discovery ceiling.
    pub fn with_max_accounts(mut self, max: u32) -> Self {
        self.max_bip44_accounts = max;
        self
    }

    /// Sets the minimum interval between balance cross-checks.
    pub fn with_balance_check_interval(mut self, interval: Duration) -> Self {
        self.balance_check_interval = interval;
        self
    }

    /// BIP44 coin type for the configured network (5 on mainnet, 1 on test
    /// networks).
    pub fn coin_type(&self) -> u32 {
        match self.network {
            Network::Dash => 5,
            _ => 1,
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.address_scan_gap_limit == 0 {
            return Err("address_scan_gap_limit must be at least 1".to_string());
        }
        if self.scan_batch_size == 0 {
            return Err("scan_batch_size must be at least 1".to_string());
        }
        if self.max_bip44_accounts == 0 {
            return Err("max_bip44_accounts must be at least 1".to_string());
        }
        if self.max_addresses_to_scan < self.address_scan_gap_limit {
            return Err(
                "max_addresses_to_scan must be at least the gap limit".to_string(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.network, Network::Dash);
        assert_eq!(config.address_scan_gap_limit, 20);
        assert_eq!(config.scan_batch_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_coin_type_by_network() {
        assert_eq!(SyncConfig::mainnet().coin_type(), 5);
        assert_eq!(SyncConfig::testnet().coin_type(), 1);
        assert_eq!(SyncConfig::new(Network::Regtest).coin_type(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        assert!(SyncConfig::testnet().with_gap_limit(0).validate().is_err());
        assert!(SyncConfig::testnet().with_scan_batch_size(0).validate().is_err());
        assert!(SyncConfig::testnet().with_max_accounts(0).validate().is_err());
        assert!(SyncConfig::testnet()
            .with_gap_limit(50)
            .with_max_addresses_to_scan(10)
            .validate()
            .is_err());
    }
}
