fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Print the redacted statement plan for the configured engine and exit 0/1.
    if args.iter().any(|a| a == "--dry-run") {
        aurora_db_users::run_dry_run();
        return;
    }

    // Single provisioning pass outside the Lambda runtime (local/CI use). Exits 0/1.
    if args.iter().any(|a| a == "--run-once") {
        aurora_db_users::run_once();
        return;
    }

    aurora_db_users::run_lambda();
}
