//! Build script for vpn-bypass
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `vpn-bypass --version`.

fn main() {
    // Re-run build if the default firewall binaries are overridden by packagers
    println!("cargo:rerun-if-env-changed=VPN_BYPASS_IPTABLES");
    println!("cargo:rerun-if-env-changed=VPN_BYPASS_IP6TABLES");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
