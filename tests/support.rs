#![allow(dead_code)]

use std::any::Any;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;

use remotelink::{MessagePump, MessageTable, PumpHandle, Receiver, Remote, Wire};

static TRACING: Once = Once::new();

/// Installs the diagnostic subscriber once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Login request fixture, message id 101.
#[derive(Debug, Clone, PartialEq)]
pub struct Login2Gate {
    pub account: String,
    pub password: String,
}

impl Wire for Login2Gate {
    fn encode<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.account.encode(dest)?;
        self.password.encode(dest)
    }

    fn decode<R: Read>(src: &mut R) -> std::io::Result<Self> {
        Ok(Login2Gate {
            account: String::decode(src)?,
            password: String::decode(src)?,
        })
    }
}

/// Login reply fixture, message id 102.
#[derive(Debug, Clone, PartialEq)]
pub struct Login2GateResult {
    pub is_success: bool,
}

impl Wire for Login2GateResult {
    fn encode<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.is_success.encode(dest)
    }

    fn decode<R: Read>(src: &mut R) -> std::io::Result<Self> {
        Ok(Login2GateResult { is_success: bool::decode(src)? })
    }
}

/// Plain one-way message fixture, message id 103.
#[derive(Debug, Clone, PartialEq)]
pub struct Chat {
    pub text: String,
}

impl Wire for Chat {
    fn encode<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.text.encode(dest)
    }

    fn decode<R: Read>(src: &mut R) -> std::io::Result<Self> {
        Ok(Chat { text: String::decode(src)? })
    }
}

/// Reply of the wrong type for mismatch scenarios, message id 999.
#[derive(Debug, Clone, PartialEq)]
pub struct Unexpected {
    pub code: i32,
}

impl Wire for Unexpected {
    fn encode<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.code.encode(dest)
    }

    fn decode<R: Read>(src: &mut R) -> std::io::Result<Self> {
        Ok(Unexpected { code: i32::decode(src)? })
    }
}

/// Table with every fixture type registered.
pub fn test_table() -> Arc<MessageTable> {
    let mut table = MessageTable::new();
    table.register::<Login2Gate>(101);
    table.register::<Login2GateResult>(102);
    table.register::<Chat>(103);
    table.register::<Unexpected>(999);
    Arc::new(table)
}

/// Starts a pump on its own task and returns the enqueue handle.
pub fn spawn_pump() -> PumpHandle {
    init_tracing();
    let (pump, handle) = MessagePump::new();
    tokio::spawn(pump.serve());
    handle
}

/// Answers every `Login2Gate` request with a successful result.
pub struct LoginReceiver;

#[async_trait]
impl Receiver for LoginReceiver {
    async fn deal_message(
        &self,
        _session: Arc<Remote>,
        message: Box<dyn Any + Send>,
    ) -> Option<Box<dyn Any + Send>> {
        if message.downcast_ref::<Login2Gate>().is_some() {
            Some(Box::new(Login2GateResult { is_success: true }))
        } else {
            None
        }
    }
}

/// Never replies; requests against this receiver time out on the peer.
pub struct SilentReceiver;

#[async_trait]
impl Receiver for SilentReceiver {
    async fn deal_message(
        &self,
        _session: Arc<Remote>,
        _message: Box<dyn Any + Send>,
    ) -> Option<Box<dyn Any + Send>> {
        None
    }
}

/// Replies to every request with a message of the wrong type.
pub struct MismatchReceiver;

#[async_trait]
impl Receiver for MismatchReceiver {
    async fn deal_message(
        &self,
        _session: Arc<Remote>,
        _message: Box<dyn Any + Send>,
    ) -> Option<Box<dyn Any + Send>> {
        Some(Box::new(Unexpected { code: -7 }))
    }
}

/// Records the text of every `Chat` it sees, in arrival order.
#[derive(Default)]
pub struct CollectReceiver {
    pub seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Receiver for CollectReceiver {
    async fn deal_message(
        &self,
        _session: Arc<Remote>,
        message: Box<dyn Any + Send>,
    ) -> Option<Box<dyn Any + Send>> {
        if let Some(chat) = message.downcast_ref::<Chat>() {
            self.seen.lock().expect("seen mutex poisoned").push(chat.text.clone());
        }
        None
    }
}
