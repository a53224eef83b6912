pub mod sftp;

pub use sftp::control::SftpControlSocket;
pub use sftp::driver::SftpDriver;
