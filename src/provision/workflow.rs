//! Top level runs behind the command line subcommands, wiring the
//! controller to the real consoles, network and host daemons.
use super::{
    context::{authorized_keys, RunContext, SshKey},
    dhcp::DhcpdConfig,
    http,
    media::{self, HostMediaStore, MediaSource},
    network::{self, Liveness, SshLiveness},
    services::{Service, ServiceRegistry},
    signal, ProvisioningController, Success,
};
use crate::{
    config::ProvisioningConfig,
    devices::{flasher::FlashJob, reset::{ResetPath, ResetProtocol}},
    drivers::TtyConsole,
    error::Error,
    utilities::lock::InstanceLock,
};
use log::info;
use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    thread::sleep,
    time::Duration,
};

const SERVICE_SETTLE: Duration = Duration::from_secs(3);

/// `<dir>/<prefix>-serial.<timestamp>.log`, unique per run.
pub fn transcript_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{}-serial.{}.log", prefix, chrono::Local::now().format("%Y%m%d-%H%M%S.%6f")))
}

fn consoles(config: &ProvisioningConfig, prefix: &str) -> (TtyConsole, TtyConsole) {
    let transcript = transcript_path(&config.paths.transcript_dir, prefix);
    info!(
        "serial: firmware console {} (log to {})",
        config.consoles.firmware.display(),
        transcript.display()
    );
    (
        TtyConsole::new(config.consoles.firmware.clone()).with_transcript(transcript),
        TtyConsole::new(config.consoles.management.clone()),
    )
}

/// Installs the media on the card and waits until it answers over SSH.
pub fn pxeboot(config: ProvisioningConfig) -> Result<Success, Error> {
    let _lock = InstanceLock::acquire(&config.paths.state_dir)?;
    let source = config
        .media
        .as_deref()
        .map(MediaSource::parse)
        .ok_or_else(|| Error::ConfigurationError(String::from("No install media given")))?;
    let release = signal::release_on_sigusr1()?;
    let ctx = RunContext::new();

    let mut store = HostMediaStore::new(&config.paths);
    let kind = media::resolve_media(&mut store, &source, config.media_kind)?;
    store.mount_nested(kind)?;
    RunContext::set_once(&ctx.media_kind, "media_kind", kind)?;

    let key = SshKey::generate(&config.paths.state_dir)?;
    let mut liveness = SshLiveness::new(key.private_key().to_path_buf(), kind.ssh_user());
    RunContext::set_once(&ctx.ssh_key, "ssh_key", key)?;
    let keys = authorized_keys(ctx.ssh_key.get(), &config.ssh_keys);
    for key in keys.iter() {
        info!("prepare-host: use SSH key {:?}", key);
    }

    info!("Configure host for PXE boot");
    let _address = network::assign_host_address(&config.network, &config.interface)?;

    let (firmware, management) = consoles(&config, "pxeboot");
    let mut controller = ProvisioningController::new(config.clone(), firmware, management).with_release(release);

    let restrict = if controller.dhcp_restricted(&ctx)? {
        Some(controller.device_mac(&ctx, None)?.0)
    } else {
        None
    };
    media::stage_tftp(kind, &config.paths, config.grub_config.as_deref())?;
    media::stage_http(&config.paths, &keys, &config.payloads)?;

    let mut services = ServiceRegistry::new();
    let dhcp = DhcpdConfig::for_media(&config.network, kind, restrict);
    services.start(&dhcp.prepare(&config.paths.dhcp_dir, &config.interface)?)?;
    services.start(&Service::tftp(&config.paths.tftp_root))?;
    services.start(&http::service(&config.paths.www_root, config.network.http_port)?)?;
    info!("Giving services time to settle");
    sleep(SERVICE_SETTLE);
    services.check()?;

    if config.prompt {
        wait_for_operator()?;
    }
    ctx.mark_prompted();

    let ip = controller.boot_with_retries(&ctx, &mut liveness, || services.check())?;
    let others = liveness.other_addresses(ip);

    info!("Terminating http, tftp, and dhcpd");
    services.stop_all();
    Ok(Success { ip, user: kind.ssh_user(), others })
}

fn wait_for_operator() -> Result<(), Error> {
    print!("dhcp/tftp/http services started. Waiting. Press ENTER to continue or abort with CTRL+C");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

/// Writes a firmware image to the card's SPI flash through U-Boot.
pub fn fwupdate(config: ProvisioningConfig) -> Result<(), Error> {
    let _lock = InstanceLock::acquire(&config.paths.state_dir)?;
    let image = config
        .flash
        .image
        .clone()
        .ok_or_else(|| Error::ConfigurationError(String::from("No firmware image given")))?;
    let name = image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::ConfigurationError(format!("Invalid firmware image {}", image.display())))?;

    let _address = network::assign_host_address(&config.network, &config.interface)?;
    fs::create_dir_all(&config.paths.tftp_root)?;
    fs::copy(&image, config.paths.tftp_root.join(&name))?;

    let mut services = ServiceRegistry::new();
    let dhcp = DhcpdConfig { plan: &config.network, boot_filename: None, restrict: None };
    services.start(&dhcp.prepare(&config.paths.dhcp_dir, &config.interface)?)?;
    services.start(&Service::tftp(&config.paths.tftp_root))?;
    info!("Giving services time to settle");
    sleep(Duration::from_secs(config.flash.service_settle_s));
    services.check()?;

    let job = FlashJob { server: config.network.host, image: name, slot: config.flash.slot };
    let (firmware, management) = consoles(&config, "fwupdate");
    ProvisioningController::new(config.clone(), firmware, management).flash(&job)?;

    info!("Terminating tftp and dhcpd");
    services.stop_all();
    Ok(())
}

/// Only resets the card.
pub fn reset(config: &ProvisioningConfig) -> Result<ResetPath, Error> {
    ResetProtocol::new(TtyConsole::new(config.consoles.management.clone()), config.timing())
        .with_attempts(config.reset_attempts)
        .reset()
}
