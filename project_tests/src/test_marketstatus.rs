//! # Market Status Live Data Test
//!
//! Polls the live Nasdaq market-info endpoint once through
//! `finstream_core` and prints what the oracle would see.

use chrono::Utc;
use finstream_core::markets::nasdaq::NasdaqStatusSource;
use finstream_core::markets::StatusSource;

/// Executes the live market status fetch.
///
/// // Statement: Prints the raw payload, the mapped state and the time until the next open.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let tz = chrono_tz::America::New_York;
    let source = NasdaqStatusSource::new(tz)?;

    println!("[*] Requesting live data from Nasdaq API...");

    let data = match source.status().await {
        Ok(data) => data,
        Err(e) => {
            // // Statement: Failure - Print specific error details to stderr
            eprintln!("\n[ERROR] Market status retrieval failed:");
            eprintln!(">>> {}", e);
            std::process::exit(1);
        }
    };

    println!("\n[SUCCESS] Data received:");
    println!("-----------------------------------------------");
    println!("{}", serde_json::to_string_pretty(&data)?);
    println!("-----------------------------------------------");

    let now = Utc::now().with_timezone(&tz).naive_local();
    println!("[INFO] Mapped state: {:?}", data.state());
    println!("[INFO] Time until open: {:?}", data.time_until_open(now));

    // // Statement: Same call path the oracle uses, including the poll delay inputs
    let reading = source.fetch().await?;
    println!("[INFO] Oracle reading: {:?}", reading);

    Ok(())
}
