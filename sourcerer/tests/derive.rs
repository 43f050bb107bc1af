#![allow(missing_docs)]
//! Tests for the `#[derive(Event)]` and `#[derive(Command)]` macros.

use serde::Serialize;
use sourcerer::{CommandType, Event};
use sourcerer_derive::{Command, Event as DeriveEvent};

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, DeriveEvent)]
enum AccountEvent {
    Opened,
    Deposited(u64),
    Closed { reason: String },
}

#[test]
fn event_derive_names_each_variant() {
    assert_eq!(AccountEvent::Opened.event_type(), "Opened");
    assert_eq!(AccountEvent::Deposited(10).event_type(), "Deposited");
    assert_eq!(
        AccountEvent::Closed {
            reason: "fraud".into()
        }
        .event_type(),
        "Closed"
    );
}

#[derive(Debug, Serialize, Command)]
struct OpenAccount {
    owner: String,
}

#[test]
fn command_derive_names_a_struct_command() {
    let cmd = OpenAccount {
        owner: "Bob".into(),
    };
    assert_eq!(cmd.command_type(), "OpenAccount");
}

#[derive(Debug, Serialize, Command)]
enum AccountCommand {
    Open { owner: String },
    Deposit(u64),
    Close,
}

#[test]
fn command_derive_names_each_enum_variant() {
    assert_eq!(
        AccountCommand::Open {
            owner: "Bob".into()
        }
        .command_type(),
        "Open"
    );
    assert_eq!(AccountCommand::Deposit(5).command_type(), "Deposit");
    assert_eq!(AccountCommand::Close.command_type(), "Close");
}
