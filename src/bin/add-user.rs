//! Provision a mailbox: create `<root>/<domain>/users/<user>` with a fresh
//! Maildir.

use postbox_rs::address::Address;
use postbox_rs::domain::DomainRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} <domain-root> <user@domain>", args[0]);
        eprintln!("Example: {} /srv/domains alice@example.com", args[0]);
        std::process::exit(1);
    }

    let root = &args[1];
    let addr = Address::parse(&args[2]);
    if addr.user().is_empty() || addr.domain().is_empty() {
        eprintln!("address must have the form user@domain");
        std::process::exit(1);
    }

    let registry = DomainRegistry::new(root);
    let domain = registry.create_domain(addr.domain()).await?;
    let user = domain.create_user(addr.user()).await?;

    println!("created mailbox for {}@{}", user.name(), domain.name());
    println!("  {}", user.maildir_path().display());

    Ok(())
}
