use stress_test::{stress_test_scaling, stress_test_sync};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(async_main()) {
        eprintln!("stress run aborted: {}", e);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<(), tandem_sdk::SdkError> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            OFFLINE SYNC STRESS TESTS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut clean = true;

    // Test 1: reliable network, small scale
    let stats = stress_test_sync(20, 3, 4, 0.0, 1).await?;
    clean &= stats.violations.is_empty();
    stats.print();

    // Test 2: flaky network, small scale
    let stats = stress_test_sync(20, 3, 4, 0.2, 2).await?;
    clean &= stats.violations.is_empty();
    stats.print();

    // Test 3: flaky network, medium scale
    let stats = stress_test_sync(200, 5, 16, 0.2, 3).await?;
    clean &= stats.violations.is_empty();
    stats.print();

    // Test 4: scaling analysis
    stress_test_scaling(100, 25).await?;

    if clean {
        println!("\n✓ All stress tests completed without violations!");
    } else {
        println!("\n✗ Stress tests found invariant violations");
    }
    Ok(())
}
