pub mod ftp;

pub use ftp::control::FtpControlSocket;
pub use ftp::driver::FtpDriver;
