//! Example bulk publish run against the local broker.
//!
//! This example publishes a batch of orders through a broker double
//! that nacks one of them and returns another, then walks the final
//! report the way an operator would.

use bulk_publish_core::{BatchPolicy, BulkPublisher, Destination, RetryPolicy};
use bulk_publish_local::{LocalBroker, LocalTransport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    order_id: Uuid,
    client_id: Uuid,
    product_code: String,
    quantity: u32,
    unit_price: f64,
}

fn sample_orders(count: usize) -> Vec<Order> {
    (0..count)
        .map(|n| Order {
            order_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            product_code: format!("SKU-{:04}", n),
            quantity: (n as u32 % 5) + 1,
            unit_price: 9.99 + n as f64,
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // A broker that nacks the third publish and hands the seventh back
    // as unroutable.
    let broker = Arc::new(
        LocalBroker::builder()
            .exchange("orders")
            .bind("orders", "orders.created", "orders-queue")
            .nack_on(3)
            .return_on(7)
            .build(),
    );
    let publisher = BulkPublisher::new(Arc::new(LocalTransport::new(Arc::clone(&broker))));

    let destination = Destination::new("orders", "orders.created");
    let policy = BatchPolicy::new(4, Duration::from_millis(50))?;
    let retry = RetryPolicy::new(2, Duration::from_millis(100));

    let report = publisher
        .send_messages_with_retry(&destination, sample_orders(10), &policy, &retry)
        .await;

    info!(
        "campaign finished in {} ms after {} attempt(s) ({} retried)",
        report.duration().num_milliseconds(),
        report.attempts_made,
        report.retries_made()
    );
    for count in report.status_counts() {
        match count.sample_description {
            Some(description) => {
                info!("{:>16}: {} ({})", count.status.to_string(), count.count, description)
            }
            None => info!("{:>16}: {}", count.status.to_string(), count.count),
        }
    }

    if report.has_possible_duplicates() {
        for state in report.possible_duplicates() {
            warn!(
                "message {} was transmitted {} times and may reach consumers more than once",
                state.id, state.send_count
            );
        }
    }
    if report.has_unknown_outcomes() {
        for state in report.unresolved() {
            warn!("message {} has an unknown outcome: {}", state.id, state.status);
        }
    }

    info!(
        "queue 'orders-queue' received {} message(s)",
        broker.message_count("orders-queue")
    );
    Ok(())
}
