//! TUN device driver.
//!
//! Opens a layer-3 TUN interface, hands the engine a poll-mode reader and
//! writes outbound packets straight to the device. Routes for intercepted
//! addresses are managed through [`RouteManager`].

use std::fs::File;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::routing::RouteManager;
use super::{NetifDriver, PacketReader};
use crate::error::{Error, Result};

/// TUN device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    /// Device name. On macOS this is a hint and the kernel picks a `utunN`.
    #[serde(default = "default_device_name")]
    pub name: String,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    #[serde(default = "default_ipv4_addr")]
    pub ipv4_addr: Option<Ipv4Addr>,

    #[serde(default = "default_netmask_v4")]
    pub ipv4_netmask: u8,

    #[serde(default)]
    pub ipv6_addr: Option<Ipv6Addr>,

    #[serde(default = "default_netmask_v6")]
    pub ipv6_prefix: u8,

    /// Queue route changes until the engine commits them.
    #[serde(default)]
    pub defer_route_commit: bool,
}

fn default_device_name() -> String {
    if cfg!(target_os = "macos") {
        "utun".to_string()
    } else {
        "tunnelgate0".to_string()
    }
}

fn default_mtu() -> u16 {
    1500
}

fn default_ipv4_addr() -> Option<Ipv4Addr> {
    Some(Ipv4Addr::new(100, 64, 0, 1))
}

fn default_netmask_v4() -> u8 {
    10
}

fn default_netmask_v6() -> u8 {
    64
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            mtu: default_mtu(),
            ipv4_addr: default_ipv4_addr(),
            ipv4_netmask: default_netmask_v4(),
            ipv6_addr: None,
            ipv6_prefix: default_netmask_v6(),
            defer_route_commit: false,
        }
    }
}

/// Driver backed by a host TUN device.
pub struct TunDriver {
    config: TunConfig,
    name: String,
    file: Arc<File>,
    reader_taken: bool,
    routes: RouteManager,
}

impl TunDriver {
    /// Create and configure the device.
    ///
    /// Requires `CAP_NET_ADMIN` on Linux and root on macOS.
    pub fn create(config: TunConfig) -> Result<Self> {
        let (file, name) = open_device(&config.name)?;
        tracing::info!(requested = %config.name, actual = %name, mtu = config.mtu, "Created TUN device");

        let driver = Self {
            routes: RouteManager::new(&name, config.defer_route_commit),
            config,
            name,
            file: Arc::new(file),
            reader_taken: false,
        };
        driver.configure()?;
        Ok(driver)
    }

    pub fn config(&self) -> &TunConfig {
        &self.config
    }

    fn configure(&self) -> Result<()> {
        ifconfig(&[&self.name, "mtu", &self.config.mtu.to_string()])?;

        if let Some(addr) = self.config.ipv4_addr {
            #[cfg(target_os = "linux")]
            ip(&["addr", "add", &format!("{addr}/{}", self.config.ipv4_netmask), "dev", &self.name])?;

            #[cfg(target_os = "macos")]
            {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.config.ipv4_netmask.min(32)))
                    .unwrap_or(0);
                let a = addr.to_string();
                ifconfig(&[&self.name, "inet", &a, &a, "netmask", &Ipv4Addr::from(mask).to_string()])?;
            }
        }

        if let Some(addr) = self.config.ipv6_addr {
            let cidr = format!("{addr}/{}", self.config.ipv6_prefix);

            #[cfg(target_os = "linux")]
            ip(&["-6", "addr", "add", &cidr, "dev", &self.name])?;

            #[cfg(target_os = "macos")]
            ifconfig(&[&self.name, "inet6", &cidr])?;

            #[cfg(not(any(target_os = "linux", target_os = "macos")))]
            let _ = cidr;
        }

        ifconfig(&[&self.name, "up"])
    }
}

impl NetifDriver for TunDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn reader(&mut self) -> Option<Box<dyn PacketReader>> {
        if self.reader_taken {
            return None;
        }
        self.reader_taken = true;
        Some(Box::new(TunReader::new(Arc::clone(&self.file))))
    }

    fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        write_frame(&self.file, packet)
    }

    fn add_route(&mut self, dest: &IpNet) -> Result<()> {
        self.routes.add(dest)
    }

    fn delete_route(&mut self, dest: &IpNet) -> Result<()> {
        self.routes.delete(dest)
    }

    fn supports_route_exclusion(&self) -> bool {
        true
    }

    fn exclude_route(&mut self, dest: IpAddr) -> Result<()> {
        self.routes.exclude(dest)
    }

    fn commit_routes(&mut self) -> Result<()> {
        self.routes.commit()
    }
}

impl Drop for TunDriver {
    fn drop(&mut self) {
        tracing::debug!(name = %self.name, "Closing TUN device");
    }
}

#[cfg(unix)]
struct TunReader {
    file: Arc<File>,
    fd: Option<tokio::io::unix::AsyncFd<Arc<File>>>,
}

#[cfg(unix)]
impl TunReader {
    fn new(file: Arc<File>) -> Self {
        Self { file, fd: None }
    }
}

#[cfg(unix)]
#[async_trait]
impl PacketReader for TunReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::io::AsRawFd;

        let fd = match &mut self.fd {
            Some(fd) => fd,
            none => none.insert(tokio::io::unix::AsyncFd::new(Arc::clone(&self.file))?),
        };

        loop {
            let mut guard = fd.readable().await?;
            let result = guard.try_io(|inner| read_frame(inner.get_ref().as_raw_fd(), buf));
            match result {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[cfg(not(unix))]
struct TunReader;

#[cfg(not(unix))]
impl TunReader {
    fn new(_file: Arc<File>) -> Self {
        Self
    }
}

#[cfg(not(unix))]
#[async_trait]
impl PacketReader for TunReader {
    async fn read_packet(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "TUN not supported on this platform"))
    }
}

/// utun prefixes every packet with a 4-byte address family.
#[cfg(target_os = "macos")]
const FRAME_HEADER: usize = 4;

#[cfg(target_os = "linux")]
fn read_frame(fd: std::os::unix::io::RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

#[cfg(target_os = "macos")]
fn read_frame(fd: std::os::unix::io::RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut frame = vec![0u8; buf.len() + FRAME_HEADER];
    let ret = unsafe { libc::read(fd, frame.as_mut_ptr().cast(), frame.len()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let len = (ret as usize).saturating_sub(FRAME_HEADER);
    buf[..len].copy_from_slice(&frame[FRAME_HEADER..FRAME_HEADER + len]);
    Ok(len)
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
fn read_frame(_fd: std::os::unix::io::RawFd, _buf: &mut [u8]) -> io::Result<usize> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "TUN not supported on this platform"))
}

/// Write one packet without blocking. A full device queue drops the packet.
#[cfg(target_os = "linux")]
fn write_frame(file: &File, packet: &[u8]) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::write(file.as_raw_fd(), packet.as_ptr().cast(), packet.len()) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn write_frame(file: &File, packet: &[u8]) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let af: u32 = match packet.first().map(|b| b >> 4) {
        Some(6) => libc::AF_INET6 as u32,
        _ => libc::AF_INET as u32,
    };
    let mut frame = Vec::with_capacity(packet.len() + FRAME_HEADER);
    frame.extend_from_slice(&af.to_be_bytes());
    frame.extend_from_slice(packet);

    let ret = unsafe { libc::write(file.as_raw_fd(), frame.as_ptr().cast(), frame.len()) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn write_frame(_file: &File, _packet: &[u8]) -> Result<()> {
    Err(Error::NotSupported("TUN devices on this platform".into()))
}

#[cfg(target_os = "linux")]
fn open_device(requested: &str) -> Result<(File, String)> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open("/dev/net/tun")?;

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let name = requested.as_bytes();
    let len = name.len().min(libc::IFNAMSIZ - 1);
    for (dst, src) in ifr.ifr_name.iter_mut().zip(&name[..len]) {
        *dst = *src as libc::c_char;
    }
    ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) } < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let actual = unsafe { std::ffi::CStr::from_ptr(ifr.ifr_name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    Ok((file, actual))
}

#[cfg(target_os = "macos")]
fn open_device(requested: &str) -> Result<(File, String)> {
    use std::os::unix::io::FromRawFd;

    const PF_SYSTEM: libc::c_int = 32;
    const SYSPROTO_CONTROL: libc::c_int = 2;
    const AF_SYS_CONTROL: u16 = 2;
    const UTUN_OPT_IFNAME: libc::c_int = 2;
    const CTLIOCGINFO: libc::c_ulong = 0xc064_4e03;

    #[repr(C)]
    struct CtlInfo {
        ctl_id: u32,
        ctl_name: [u8; 96],
    }

    #[repr(C)]
    struct SockaddrCtl {
        sc_len: u8,
        sc_family: u8,
        ss_sysaddr: u16,
        sc_id: u32,
        sc_unit: u32,
        sc_reserved: [u32; 5],
    }

    let fd = unsafe { libc::socket(PF_SYSTEM, libc::SOCK_DGRAM, SYSPROTO_CONTROL) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // Owns the descriptor from here on, closing it on early return
    let file = unsafe { File::from_raw_fd(fd) };

    let mut info: CtlInfo = unsafe { std::mem::zeroed() };
    let control = b"com.apple.net.utun_control";
    info.ctl_name[..control.len()].copy_from_slice(control);
    if unsafe { libc::ioctl(fd, CTLIOCGINFO, &mut info) } < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    // "utun5" asks for unit 6; anything else lets the kernel choose
    let unit = requested
        .strip_prefix("utun")
        .and_then(|n| n.parse::<u32>().ok())
        .map_or(0, |n| n + 1);

    let mut addr: SockaddrCtl = unsafe { std::mem::zeroed() };
    addr.sc_len = std::mem::size_of::<SockaddrCtl>() as u8;
    addr.sc_family = PF_SYSTEM as u8;
    addr.ss_sysaddr = AF_SYS_CONTROL;
    addr.sc_id = info.ctl_id;
    addr.sc_unit = unit;

    let ret = unsafe {
        libc::connect(
            fd,
            (&addr as *const SockaddrCtl).cast(),
            std::mem::size_of::<SockaddrCtl>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let mut name_buf = [0u8; 64];
    let mut name_len = name_buf.len() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            SYSPROTO_CONTROL,
            UTUN_OPT_IFNAME,
            name_buf.as_mut_ptr().cast(),
            &mut name_len,
        )
    };
    if ret < 0 || name_len < 2 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    let actual = String::from_utf8_lossy(&name_buf[..name_len as usize - 1]).into_owned();

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok((file, actual))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn open_device(_requested: &str) -> Result<(File, String)> {
    Err(Error::NotSupported("TUN devices on this platform".into()))
}

fn ifconfig(args: &[&str]) -> Result<()> {
    run_tool("ifconfig", args)
}

#[cfg(target_os = "linux")]
fn ip(args: &[&str]) -> Result<()> {
    run_tool("ip", args)
}

fn run_tool(program: &str, args: &[&str]) -> Result<()> {
    if cfg!(not(unix)) {
        return Err(Error::NotSupported(format!("{program} on this platform")));
    }
    let output = std::process::Command::new(program).args(args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Re-adding an existing address is harmless
        if !stderr.contains("File exists") {
            return Err(Error::Config(format!("{program} {}: {}", args.join(" "), stderr.trim())));
        }
    }
    Ok(())
}
