//! Actions pool builder
//!
//! Maps an operation type tag to its ordered list of actions.

use crate::common::config::ConfigError;
use crate::types::OperationType;

use super::action::Action;
use super::redeem::{BuildTransaction, ConfirmOnChain, NotifyContract, SelectUtxos, SignAndBroadcast};
use super::OperationDeps;

/// Build the pipeline for `op_type`; unknown tags are a configuration error
pub fn build_actions_pool(
    op_type: &str,
    deps: &OperationDeps,
) -> Result<Vec<Box<dyn Action>>, ConfigError> {
    let op_type: OperationType = op_type.parse()?;

    match op_type {
        OperationType::Redeem => Ok(vec![
            Box::new(SelectUtxos::new(deps.wallet.clone())),
            Box::new(BuildTransaction::new(deps.wallet.clone())),
            Box::new(SignAndBroadcast::new(deps.wallet.clone())),
            Box::new(ConfirmOnChain::new(
                deps.wallet.clone(),
                deps.settings.required_confirmations,
            )),
            Box::new(NotifyContract::new(deps.contract.clone())),
        ]),
    }
}
