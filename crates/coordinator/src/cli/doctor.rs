use bn_domain::config::{Config, ConfigSeverity};

/// Run all diagnostic checks and print a summary.
///
/// Returns `Ok(true)` when every check passes, `Ok(false)` when at least
/// one check failed.
pub async fn run(config: &Config, config_path: &str) -> anyhow::Result<bool> {
    println!("bnode doctor");
    println!("============\n");

    let mut all_passed = true;

    check_config_file(config_path, &mut all_passed);
    check_config_validation(config, &mut all_passed);
    check_idp_reachable(config, &mut all_passed).await;
    check_state_dir(&mut all_passed);

    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }

    Ok(all_passed)
}

// ── Individual checks ─────────────────────────────────────────────────

fn check_config_file(config_path: &str, all_passed: &mut bool) {
    let exists = std::path::Path::new(config_path).exists();
    print_check(
        "Config file exists",
        exists,
        if exists {
            config_path.to_owned()
        } else {
            format!("{config_path} not found (using defaults)")
        },
    );
    if !exists {
        *all_passed = false;
    }
}

fn check_config_validation(config: &Config, all_passed: &mut bool) {
    let issues = config.validate();
    let error_count = issues
        .iter()
        .filter(|e| e.severity == ConfigSeverity::Error)
        .count();

    if issues.is_empty() {
        print_check("Config validation", true, "no issues".into());
    } else {
        print_check(
            "Config validation",
            error_count == 0,
            format!("{} issue(s) ({error_count} error(s))", issues.len()),
        );
        for issue in &issues {
            println!("      {issue}");
        }
        if error_count > 0 {
            *all_passed = false;
        }
    }
}

async fn check_idp_reachable(config: &Config, all_passed: &mut bool) {
    let endpoint = config.idp.active();
    let url = format!("{}/api/current-user", endpoint.nsn_url);
    let reachable = match reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
    {
        Ok(client) => client.get(&url).send().await.is_ok(),
        Err(_) => false,
    };

    print_check(
        "Identity provider reachable",
        reachable,
        if reachable {
            endpoint.nsn_url.clone()
        } else {
            format!("{} (unreachable)", endpoint.nsn_url)
        },
    );

    if !reachable {
        *all_passed = false;
    }
}

fn check_state_dir(all_passed: &mut bool) {
    let path = std::path::PathBuf::from(
        std::env::var("BN_STATE_DIR").unwrap_or_else(|_| "./state".into()),
    );
    let exists = path.exists() || std::fs::create_dir_all(&path).is_ok();
    let writable = if exists {
        let probe = path.join(".bnode_doctor_probe");
        let w = std::fs::write(&probe, b"probe").is_ok();
        let _ = std::fs::remove_file(&probe);
        w
    } else {
        false
    };

    let ok = exists && writable;
    let detail = match (exists, writable) {
        (true, true) => format!("{} (writable)", path.display()),
        (true, false) => format!("{} (not writable)", path.display()),
        _ => format!("{} (does not exist)", path.display()),
    };

    print_check("State directory", ok, detail);

    if !ok {
        *all_passed = false;
    }
}

// ── Formatting helper ─────────────────────────────────────────────────

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}
