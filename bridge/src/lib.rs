// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

pub mod app_chain;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod inbound;
pub mod keyring;
pub mod metrics;
pub mod monitor;
pub mod move_fund;
pub mod node;
pub mod outbound;
pub mod pool_registry;
pub mod pub_chain;
pub mod queue;
pub mod storage;
pub mod token_list;
pub mod tss;

#[cfg(test)]
pub mod mock;


#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // Delay sequence (secs), with jitter: 0.4, 0.8, 1.6, 3.2, 6.4, ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: std::time::Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: std::time::Duration::from_secs(10),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => Ok(result),
                    Err(e) => {
                        // treat every error as transient so the call keeps
                        // retrying until max_elapsed_time runs out
                        tracing::debug!("retrying due to error: {:?}", e);
                        Err(backoff::Error::transient(e))
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}
