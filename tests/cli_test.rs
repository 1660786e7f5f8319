use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::io::Write;
use std::process::Command;
use tempfile::NamedTempFile;

const WORLD: &str = r#"{
    "stores": [{
        "id": 10, "merchant_id": 1, "crypto_currency_id": 2, "fiat_currency_id": 1,
        "fiat_currency_code": "RUB", "lower_limit": "1", "upper_limit": "100000",
        "access": true, "pay_in_enabled": true, "pay_out_enabled": true
    }],
    "traders": [{ "id": 3, "user_id": 300 }],
    "requisites": [{
        "id": 7, "trader_id": 3, "method_id": 1, "fiat_currency_id": 1, "status": "approve",
        "limits": {
            "lower_limit": "10", "upper_limit": "5000",
            "total_limit": "50000", "turnover_day_max": "1000000"
        }
    }],
    "store_commissions": [{ "owner_id": 10, "commission_pay_in": "2.5", "commission_pay_out": "1" }],
    "trader_commissions": [{ "owner_id": 3, "commission_pay_in": "1.5", "commission_pay_out": "1" }],
    "exchange_rates": [{ "crypto_currency_id": 2, "fiat_currency_id": 1, "rate": "100" }],
    "settings": { "max_retries": "1" }
}"#;

fn temp_file(contents: &str) -> Result<NamedTempFile, Box<dyn std::error::Error>> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

fn replay(world: &NamedTempFile, orders: &NamedTempFile) -> Command {
    let mut cmd = Command::new(cargo_bin!("traffic-router"));
    cmd.arg("--world")
        .arg(world.path())
        .arg("--orders")
        .arg(orders.path())
        .arg("--workers")
        .arg("2")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_cli_routes_orders() -> Result<(), Box<dyn std::error::Error>> {
    let world = temp_file(WORLD)?;
    let orders = temp_file(
        "type,merchant,store,amount,method,customer,hosted\n\
         pay_in,1,10,100,1,cust-1,false\n\
         pay_in,1,10,0.5,,,\n\
         wire,1,10,1,,,\n\
         pay_in,1,10,5,,,\n",
    )?;

    replay(&world, &orders)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "order,type,store,status,retries,settlement,settlement_status,requisite,trader,amount_currency,total_fiat,reason",
        ))
        .stdout(predicate::str::contains(
            "1,pay_in,10,assigned,0,1,pending_client_confirmation,7,3,0.975,100,",
        ))
        .stdout(predicate::str::contains(
            "2,pay_in,10,failed,1,,,,,,,No suitable requisite found: max retries exceeded",
        ))
        .stdout(predicate::str::contains("owner,owner_id,currency,balance"))
        .stderr(predicate::str::contains("Error submitting order"))
        .stderr(predicate::str::contains("Error reading order"));

    Ok(())
}

#[test]
fn test_cli_auto_confirm_settles_balances() -> Result<(), Box<dyn std::error::Error>> {
    let world = temp_file(WORLD)?;
    let orders = temp_file(
        "type,merchant,store,amount,method,customer,hosted\n\
         pay_in,1,10,100,,,false\n\
         pay_in,1,10,100,,,true\n",
    )?;

    replay(&world, &orders)
        .arg("--auto-confirm")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "1,pay_in,10,processed,0,1,completed,7,3,0.975,100,",
        ))
        .stdout(predicate::str::contains("2,pay_in,10,processed,0,"))
        .stdout(predicate::str::contains("store,10,2,1.95"))
        .stdout(predicate::str::contains("trader,3,1,3"));

    Ok(())
}

#[test]
fn test_cli_hosted_order_waits_for_client() -> Result<(), Box<dyn std::error::Error>> {
    let world = temp_file(WORLD)?;
    let orders = temp_file("type,merchant,store,amount,method,customer,hosted\npay_in,1,10,100,,,true\n")?;

    replay(&world, &orders)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "1,pay_in,10,payment_session_active,0,,,,,,,",
        ));

    Ok(())
}

#[test]
fn test_cli_rejects_invalid_world() -> Result<(), Box<dyn std::error::Error>> {
    let world = temp_file(r#"{ "balances": [{ "key": { "owner": "trader", "trader_id": 3, "fiat_currency_id": 1 }, "balance": "-1" }] }"#)?;
    let orders = temp_file("type,merchant,store,amount\n")?;

    replay(&world, &orders).assert().failure();

    Ok(())
}
