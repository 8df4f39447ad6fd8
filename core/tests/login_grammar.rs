//! End-to-end checks of the login grammar against realistic ssh
//! invocations.

use hatchway_core::login::{parse, Command};

#[test]
fn basic_root_login() {
    // ssh -p 2222 ubuntu@host
    let id = parse("ubuntu", "");
    assert_eq!(id.host_user, "root");
    assert_eq!(id.instance, "ubuntu");
    assert_eq!(id.project, "default");
    assert_eq!(id.instance_user, "root");
    assert!(id.validate().is_ok());
}

#[test]
fn instance_user_with_host_user() {
    // ssh -p 2222 dev@web.prod+admin@host
    let id = parse("dev@web.prod+admin", "");
    assert_eq!(id.host_user, "admin");
    assert_eq!(id.instance, "web");
    assert_eq!(id.project, "prod");
    assert_eq!(id.instance_user, "dev");
    assert!(id.validate().is_ok());
}

#[test]
fn on_demand_ephemeral_vm() {
    // ssh -p 2222 '~vm01+ubuntu/24.04+m4+c2+d20+vm'@host
    let id = parse("~vm01+ubuntu/24.04+m4+c2+d20+vm", "");
    assert!(id.create_instance);
    assert!(id.ephemeral_hint);
    let spec = &id.create_spec;
    assert_eq!(spec.image.as_deref(), Some("ubuntu/24.04"));
    assert_eq!(spec.memory_gib, Some(4));
    assert_eq!(spec.cpu, Some(2));
    assert_eq!(spec.disk_gib, Some(20));
    assert_eq!(spec.vm, Some(true));
    assert!(id.validate().is_ok());
}

#[test]
fn persistent_session() {
    // ssh -p 2222 '%ubuntu'@host
    let id = parse("%ubuntu", "");
    assert!(id.persistent);
    assert_eq!(id.instance, "ubuntu");
    assert!(id.validate().is_ok());
}

#[test]
fn command_logins_exclude_instance_creation() {
    let id = parse("/shell", "");
    assert_eq!(id.command, Some(Command::Shell));
    assert!(id.validate().is_ok());

    // A command cannot be combined with a create prefix; the parser keeps
    // it as the raw command name which fails validation downstream.
    let id = parse("/remove+web", "");
    assert_eq!(id.command, Some(Command::Remove { force: false }));
    assert_eq!(id.instance, "web");
    assert!(id.validate().is_ok());
}

#[test]
fn every_string_parses() {
    // The parser is total; junk yields an identity whose validation fails.
    for junk in ["", "+", "~", "%", "/", "a@b@c", ":::", "+++", "a.b.c.d"] {
        let id = parse(junk, "");
        let _ = id.validate();
        let _ = id.format();
        let _ = id.explain();
    }
}
