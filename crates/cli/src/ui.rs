//! Console output for the KubeAid CLI.
//!
//! Progress is reported here for humans; structured records go through `tracing`.

use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

/// Print the KubeAid banner.
pub fn print_banner() {
    println!();
    println!(
        "{}",
        r"
  _  __     _               _    _     _
 | |/ /   _| |__   ___     / \  (_) __| |
 | ' / | | | '_ \ / _ \   / _ \ | |/ _` |
 | . \ |_| | |_) |  __/  / ___ \| | (_| |
 |_|\_\__,_|_.__/ \___| /_/   \_\_|\__,_|
"
        .cyan()
    );
    println!("  {}", "GitOps managed Kubernetes clusters".bright_black());
    println!();
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a workflow step with its position.
pub fn print_progress_step(current: u8, total: u8, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {}: {}", key.bright_black(), value.green());
}

/// Print a shell command the user is expected to run.
pub fn print_command(command: &str) {
    println!("    {}", command.bold());
}

/// Spinner shown while blocking on a remote condition.
///
/// The caller owns the bar and must finish it.
#[must_use]
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("  {spinner:.cyan} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ");
    bar.set_style(style);
    bar.set_message(message.into());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Print how to reach the ArgoCD dashboard of a cluster.
pub fn print_argocd_access(kubeconfig: &str) {
    print_section("ArgoCD Dashboard");
    println!("  To access the ArgoCD admin dashboard:");
    println!();
    println!("  {}", "1. Use the cluster's kubeconfig:".bright_black());
    print_command(&format!("export KUBECONFIG={kubeconfig}"));
    println!("  {}", "2. Retrieve the admin password:".bright_black());
    print_command(
        "kubectl get secret argocd-initial-admin-secret -n argocd \
         -o jsonpath=\"{.data.password}\" | base64 -d",
    );
    println!("  {}", "3. Forward the ArgoCD server port:".bright_black());
    print_command("kubectl port-forward svc/argocd-server -n argocd 8080:443");
    println!("  {}", "4. Visit https://localhost:8080 and log in as admin".bright_black());
    println!();
}

/// Print the link for opening a pull request of `branch`.
pub fn print_pull_request_hint(url: &str, branch: &str) {
    println!();
    print_warning(&format!(
        "Create a pull request from branch {branch} and merge it into the default branch"
    ));
    print_kv("Pull request", url);
    println!();
}
