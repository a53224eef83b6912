//! Background task of one engine.
//!
//! While disconnected it waits for `Connect`; each connection is then
//! served by the protocol's driver until it ends.

use crate::engine::LOG_TARGET;
use xfer_core::command::Command;
use xfer_core::driver::{DriverInput, DriverInputs, ProtocolDriver, SocketEnv};
use xfer_core::reply::ReplyCode;
use xfer_core::server::{Protocol, Server};
use xfer_ftp::FtpDriver;
use xfer_sftp::SftpDriver;

/// Driver speaking `server`'s protocol.
pub fn driver_for(env: SocketEnv, server: Server) -> Box<dyn ProtocolDriver> {
    match server.protocol {
        Protocol::Sftp => Box::new(SftpDriver::new(env, server)),
        Protocol::Ftp | Protocol::Ftps | Protocol::Ftpes | Protocol::InsecureFtp => {
            Box::new(FtpDriver::new(env, server))
        }
    }
}

pub(crate) async fn run(env: SocketEnv, mut inputs: DriverInputs) {
    let logger = env.logger(LOG_TARGET);
    while let Some(input) = inputs.commands.recv().await {
        match input {
            DriverInput::Command(Command::Connect { server }) => {
                let mut driver = driver_for(env.clone(), server);
                let code = driver.run(&mut inputs).await;
                env.status.set_connected(false);
                env.context.release_all_locks(env.engine);
                logger.debug(format!("Connection ended ({:?})", code));
            }
            DriverInput::Command(Command::Disconnect) => env.complete(ReplyCode::OK),
            DriverInput::Command(other) => {
                logger.debug(format!("{:?} needs a connection", other.id()));
                env.complete(ReplyCode::NOTCONNECTED);
            }
            DriverInput::Cancel | DriverInput::AsyncReply(_) => {}
        }
    }
    logger.debug("Engine task finished");
}
