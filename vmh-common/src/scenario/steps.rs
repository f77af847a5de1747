//! Built-in step library.
//!
//! Steps are plain functions over a [`ScenarioContext`]. Composite steps call
//! the simple ones directly, so the first failing sub-step's error comes out
//! unchanged. Default timeouts are stretched by the configured patience;
//! timeouts written in a plan are used as given.

use super::context::ScenarioContext;
use super::registry::{Param, ParamKind, StepArgs, StepDefinition};
use crate::errors::{HarnessError, HarnessResult};
use crate::process::LanWebServer;
use crate::screen::{Key, Landmark, Modifiers, UiMode};
use crate::traffic::{AllowedHostSet, assert_all_flows_against, assert_connections_against};
use crate::util::{mask_secrets, random_alpha_string};
use crate::vm::{DiskBus, SizeUnit, VolumeFormat, quote};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

const BOOT_MENU: &str = "BootMenu.png";
const SYSTEM_READY: &str = "Greeter.png";
const LOGIN_BUTTON: &str = "LoginButton.png";

/// Evaluate `condition` once and fail with `message` when it is false.
fn ensure(ctx: &ScenarioContext, message: &str, condition: impl FnMut() -> HarnessResult<bool>) -> HarnessResult<()> {
    ctx.poller().wait_until_ok(Duration::ZERO, message, condition).map(|_| ())
}

/// Explicit timeout from the plan, or `default` scaled by patience.
fn timeout_arg(ctx: &ScenarioContext, args: &StepArgs<'_>, name: &str, default: Duration) -> HarnessResult<Duration> {
    Ok(args.opt_duration(name)?.unwrap_or_else(|| ctx.timeout(default)))
}

// ---------------------------------------------------------------------------
// Computer and boot configuration
// ---------------------------------------------------------------------------

fn a_computer(ctx: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.new_computer()?;
    Ok(())
}

fn intend_ui_mode(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let mode: UiMode = args.str("mode")?.parse()?;
    ctx.set_ui_mode(mode);
    Ok(())
}

fn intend_boot_options(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.set_boot_options(args.str("options")?);
    Ok(())
}

fn boot_from_cdrom(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.vm_mut()?.set_cdrom_boot(Path::new(args.str("image")?))
}

fn boot_from_drive(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let bus: DiskBus = args.str("bus")?.parse()?;
    ctx.vm_mut()?.set_disk_boot(args.str("volume")?, bus)
}

fn set_hardware_clock(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let time = parse_time(args.str("time")?)?;
    ctx.vm_mut()?.set_hardware_clock(time)
}

/// RFC 3339, or `YYYY-MM-DD HH:MM:SS` taken as UTC.
fn parse_time(text: &str) -> HarnessResult<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Ok(time.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| HarnessError::usage(format!("cannot parse time '{text}'")))
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

fn create_disk(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let name = match args.opt_str("name")? {
        Some(name) => name.to_string(),
        None => format!("disk-{}", random_alpha_string(8)),
    };
    let size = args.u64("size")?;
    let unit: SizeUnit = args.str("unit")?.parse()?;
    let format = match args.opt_str("format")? {
        Some(format) => format.parse()?,
        None => VolumeFormat::default(),
    };
    let temporary = args.bool("temporary")?;

    let pool = ctx.vm()?.storage().clone();
    if temporary {
        pool.create_temporary_disk(&name, size, unit, format)?;
        let hook_pool = pool.clone();
        let hook_name = name.clone();
        ctx.add_cleanup(format!("delete volume {name}"), move || {
            hook_pool.delete_volume_if_exists(&hook_name).map(|_| ())
        });
    } else {
        pool.create_new_disk(&name, size, unit, format)?;
    }
    info!(volume = %name, size, %unit, temporary, "disk created");
    Ok(())
}

fn plug_drive(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let name = args.str("name")?;
    let bus: DiskBus = args.str("bus")?.parse()?;
    let vm = ctx.vm_mut()?;
    vm.plug_drive(name, bus)?;
    if vm.is_running()? {
        wait_for_drive(ctx, name, ctx.timeout(secs(10)))?;
    }
    Ok(())
}

fn drive_detected(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let timeout = timeout_arg(ctx, args, "timeout", secs(10))?;
    let name = args.str("name")?;
    if !ctx.vm_mut()?.is_running()? {
        return Err(HarnessError::invalid_state("detect a drive", ctx.vm()?.state()));
    }
    wait_for_drive(ctx, name, timeout)
}

fn wait_for_drive(ctx: &ScenarioContext, name: &str, timeout: Duration) -> HarnessResult<()> {
    let vm = ctx.vm()?;
    ctx.poller()
        .wait_until_ok(timeout, &format!("drive '{name}' to be detected by the guest"), || {
            vm.disk_detected(name)
        })
        .map(|_| ())
}

// ---------------------------------------------------------------------------
// Network and traffic
// ---------------------------------------------------------------------------

fn network_plugged(ctx: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.vm_mut()?.plug_network()
}

fn network_unplugged(ctx: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.vm_mut()?.unplug_network()
}

fn network_ready(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let timeout = timeout_arg(ctx, args, "timeout", secs(30))?;
    let vm = ctx.vm()?;
    ctx.poller()
        .wait_until_ok(timeout, "network connection to be ready", || vm.has_network())
        .map(|_| ())
}

fn capture_traffic(ctx: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.start_capture().map(|_| ())
}

fn allowed_hosts(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let hosts = AllowedHostSet::from_lines(&args.str("hosts")?.replace(',', "\n"))?;
    ctx.set_allowed_hosts(hosts)
}

fn allowed_hosts_from_guest(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let path = args.str("path")?;
    let text = ctx.vm()?.file_content(path)?;
    let hosts = AllowedHostSet::from_lines(&text)?;
    info!(path, hosts = hosts.len(), "allowed hosts read from guest");
    ctx.set_allowed_hosts(hosts)
}

fn traffic_only_to_allowed_hosts(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let traffic = ctx.capture()?.snapshot()?;
    if args.bool("strict")? {
        assert_all_flows_against(&traffic, ctx.policy())
    } else {
        assert_connections_against(&traffic, ctx.policy())
    }
}

fn lan_web_server(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let expect = args.opt_str("expect")?;
    let bridge = ctx.vm()?.bridge_address()?;
    let server = Arc::new(LanWebServer::start(&ctx.config().lan_server, &bridge, &ctx.poller())?);
    ctx.add_lan_host(server.endpoint())?;
    let hook_server = Arc::clone(&server);
    ctx.add_cleanup("stop LAN web server", move || hook_server.stop());
    ctx.set_lan_server(Arc::clone(&server));

    // The host port answering is not enough; the guest must get a page.
    let command = format!("curl --silent {}", quote(&server.url()));
    let user = ctx.config().live_user.clone();
    let vm = ctx.vm()?;
    ctx.poller()
        .wait_until_ok(ctx.timeout(secs(30)), "LAN web server to serve the guest", || {
            let result = vm.execute_as(&command, &user)?;
            Ok(result.success() && expect.is_none_or(|text| result.stdout.contains(text)))
        })
        .map(|_| ())
}

// ---------------------------------------------------------------------------
// Power
// ---------------------------------------------------------------------------

fn start_computer(ctx: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
    let vm = ctx.vm_mut()?;
    if vm.is_running()? {
        return Err(HarnessError::invalid_state("start the computer", vm.state()));
    }
    vm.start()?;
    // The first click after start may only focus the viewer.
    let (w, h) = ctx.screen().dimensions()?;
    ctx.screen().click_point(w - 1, h / 2)
}

fn boot_system(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let menu = Landmark::new(args.opt_str("menu")?.unwrap_or(BOOT_MENU));
    let ready = Landmark::new(args.opt_str("ready")?.unwrap_or(SYSTEM_READY));
    let timeout = timeout_arg(ctx, args, "timeout", secs(5 * 60))?;

    ctx.screen().wait_for(&menu, ctx.timeout(secs(30)))?;
    if let Some(options) = ctx.boot_options() {
        ctx.screen().type_text(&format!(" {options}"))?;
    }
    ctx.screen().press(Key::Enter)?;
    ctx.screen().wait_for(&ready, timeout)?;
    let shell_timeout = ctx.config().remote_shell_timeout;
    ctx.vm()?.wait_until_remote_shell_is_up(shell_timeout)?;
    Ok(())
}

fn log_in(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let button = Landmark::new(args.opt_str("button")?.unwrap_or(LOGIN_BUTTON));
    ctx.screen().wait_and_click(&button, ctx.timeout(secs(10)))?;
    let user = ctx.config().live_user.clone();
    wait_for_session(ctx, &user, ctx.timeout(secs(120)))
}

fn session_open(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let user = match args.opt_str("user")? {
        Some(user) => user.to_string(),
        None => ctx.config().live_user.clone(),
    };
    let timeout = timeout_arg(ctx, args, "timeout", secs(120))?;
    wait_for_session(ctx, &user, timeout)
}

/// Wait until `loginctl` lists a seat session for `user`.
fn wait_for_session(ctx: &ScenarioContext, user: &str, timeout: Duration) -> HarnessResult<()> {
    let pattern = format!(r"(?m)^\s*\S+\s+\d+\s+{}\s+seat\d+\s+\S+\s*$", regex::escape(user));
    let session = Regex::new(&pattern).map_err(|e| HarnessError::usage(format!("bad session pattern: {e}")))?;
    let vm = ctx.vm()?;
    ctx.poller()
        .wait_until_ok(timeout, &format!("session for '{user}' to open"), || {
            Ok(session.is_match(&vm.execute_successfully("loginctl")?.stdout))
        })
        .map(|_| ())
}

fn start_system(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    if args.bool("dvd")? {
        let image = args
            .opt_str("image")?
            .ok_or_else(|| HarnessError::usage("booting from DVD needs an 'image'"))?;
        ctx.vm_mut()?.set_cdrom_boot(Path::new(image))?;
    }
    bring_up(ctx, args)
}

fn start_system_from_drive(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    boot_from_drive(ctx, args)?;
    bring_up(ctx, args)
}

fn bring_up(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    if args.bool("network_unplugged")? {
        network_unplugged(ctx, args)?;
    } else {
        network_plugged(ctx, args)?;
    }
    start_computer(ctx, args)?;
    boot_system(ctx, &StepArgs::empty())?;
    if args.bool("login")? {
        log_in(ctx, &StepArgs::empty())?;
    }
    Ok(())
}

fn power_off(ctx: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
    let vm = ctx.vm_mut()?;
    if !vm.is_running()? {
        return Err(HarnessError::invalid_state("power off the computer", vm.state()));
    }
    vm.power_off()
}

fn cold_reboot(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    power_off(ctx, args)?;
    start_computer(ctx, args)
}

fn warm_reboot(ctx: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.vm()?.spawn("reboot", "root")
}

fn destroy_computer(ctx: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.vm_mut()?.destroy_and_undefine()
}

fn eject_boot_medium(ctx: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.vm_mut()?.eject_boot_medium()
}

fn shuts_down_within(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let minutes = args.u64("minutes")?;
    let seconds = minutes
        .checked_mul(60)
        .ok_or_else(|| HarnessError::usage(format!("{minutes} minutes is too long a wait")))?;
    let timeout = secs(seconds);
    wait_for_power_off(ctx, timeout)
}

fn shutdown_and_wait(ctx: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.vm()?.spawn("poweroff", "root")?;
    wait_for_power_off(ctx, ctx.timeout(secs(3 * 60)))
}

fn wait_for_power_off(ctx: &mut ScenarioContext, timeout: Duration) -> HarnessResult<()> {
    let poller = ctx.poller();
    let vm = ctx.vm_mut()?;
    poller
        .wait_until_ok(
            timeout,
            &format!("VM is still running after {}s", timeout.as_secs()),
            || Ok(!vm.is_running()?),
        )
        .map(|_| ())
}

// ---------------------------------------------------------------------------
// Guest commands, processes and files
// ---------------------------------------------------------------------------

fn execute(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let command = args.str("command")?;
    let vm = ctx.vm()?;
    let user = args.opt_str("user")?.unwrap_or(vm.default_user());
    let result = vm.execute_as(command, user)?;
    info!(
        command = %mask_secrets(command),
        user,
        exit_code = result.exit_code,
        stdout = %result.stdout_trimmed(),
        "guest command executed"
    );
    Ok(())
}

fn command_outcome(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let command = args.str("command")?;
    let expect_success = match args.str("outcome")? {
        "succeeds" => true,
        "fails" => false,
        other => {
            return Err(HarnessError::usage(format!(
                "outcome must be 'succeeds' or 'fails', got '{other}'"
            )));
        }
    };
    let vm = ctx.vm()?;
    if expect_success {
        return vm.execute_successfully(command).map(|_| ());
    }
    let result = vm.execute(command)?;
    ensure(
        ctx,
        &format!("running '{}' was expected to fail\n{result}", mask_secrets(command)),
        || Ok(result.failure()),
    )
}

fn process_running(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let name = args.str("name")?;
    let vm = ctx.vm()?;
    ensure(ctx, &format!("process '{name}' is not running"), || vm.has_process(name))
}

fn process_not_running(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let name = args.str("name")?;
    let vm = ctx.vm()?;
    ensure(ctx, &format!("process '{name}' is running"), || Ok(!vm.has_process(name)?))
}

fn process_running_within(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let name = args.str("name")?;
    let timeout = args.duration("timeout")?;
    let vm = ctx.vm()?;
    ctx.poller()
        .wait_until_ok(
            timeout,
            &format!("process '{name}' is not running after {}s", timeout.as_secs()),
            || vm.has_process(name),
        )
        .map(|_| ())
}

fn process_stopped_within(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let name = args.str("name")?;
    let timeout = args.duration("timeout")?;
    let vm = ctx.vm()?;
    ctx.poller()
        .wait_until_ok(
            timeout,
            &format!("process '{name}' is still running after {}s", timeout.as_secs()),
            || Ok(!vm.has_process(name)?),
        )
        .map(|_| ())
}

fn kill_process(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let name = args.str("name")?;
    let vm = ctx.vm()?;
    vm.execute(&format!("killall {}", quote(name)))?;
    ctx.poller()
        .wait_until_ok(
            ctx.timeout(secs(10)),
            &format!("process '{name}' could not be killed"),
            || Ok(!vm.has_process(name)?),
        )
        .map(|_| ())
}

fn file_exists(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let path = args.str("path")?;
    let timeout = args.opt_duration("timeout")?.unwrap_or_default();
    let vm = ctx.vm()?;
    ctx.poller()
        .wait_until_ok(
            timeout,
            &format!("file {path} does not exist after {}s", timeout.as_secs()),
            || vm.file_exist(path),
        )
        .map(|_| ())
}

fn file_absent(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let path = args.str("path")?;
    let vm = ctx.vm()?;
    ensure(ctx, &format!("file {path} exists"), || Ok(!vm.file_exist(path)?))
}

fn directory_exists(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let path = args.str("path")?;
    let vm = ctx.vm()?;
    ensure(ctx, &format!("directory {path} does not exist"), || vm.directory_exist(path))
}

fn directory_absent(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let path = args.str("path")?;
    let vm = ctx.vm()?;
    ensure(ctx, &format!("directory {path} exists"), || Ok(!vm.directory_exist(path)?))
}

fn copy_file(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let source = args.str("source")?;
    let destination = args.str("destination")?;
    let user = match args.opt_str("user")? {
        Some(user) => user.to_string(),
        None => ctx.config().live_user.clone(),
    };
    ctx.vm()?
        .execute_successfully_as(&format!("cp {} {}", quote(source), quote(destination)), &user)
        .map(|_| ())
}

fn package_installed(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let package = args.str("package")?;
    let command = format!(
        "dpkg -s {} 2>/dev/null | grep -qs '^Status:.*installed$'",
        quote(package)
    );
    let vm = ctx.vm()?;
    ensure(ctx, &format!("package '{package}' is not installed"), || {
        Ok(vm.execute(&command)?.success())
    })
}

fn time_synchronized(ctx: &mut ScenarioContext, _: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.vm()?.host_to_guest_time_sync()
}

// ---------------------------------------------------------------------------
// Screen
// ---------------------------------------------------------------------------

fn see_or_not(ctx: &ScenarioContext, landmark: &Landmark, timeout: Duration, absent: bool) -> HarnessResult<()> {
    match (ctx.screen().wait_for(landmark, timeout), absent) {
        (Ok(_), false) => Ok(()),
        (Ok(_), true) => Err(HarnessError::StillPresent {
            landmark: landmark.to_string(),
            timeout,
        }),
        (Err(HarnessError::NotFound { .. }), true) => Ok(()),
        (Err(err), _) => Err(err),
    }
}

fn see(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let landmark = Landmark::new(args.str("landmark")?);
    see_or_not(ctx, &landmark, args.duration("timeout")?, false)
}

fn do_not_see(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let landmark = Landmark::new(args.str("landmark")?);
    see_or_not(ctx, &landmark, args.duration("timeout")?, true)
}

fn see_mode_screen(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let landmark = ctx.mode_landmark(args.str("name")?);
    see_or_not(ctx, &landmark, args.duration("timeout")?, args.bool("absent")?)
}

fn type_text(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    ctx.screen().type_text(args.str("text")?)
}

fn press_key(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let key: Key = args.str("key")?.parse()?;
    let modifiers = match args.opt_str("modifiers")? {
        Some(mods) => mods.parse()?,
        None => Modifiers::NONE,
    };
    ctx.screen().type_input(key, modifiers)
}

fn context_menu(ctx: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let top = Landmark::new(args.str("top")?);
    let bottom = Landmark::new(args.str("bottom")?);
    let item = Landmark::new(args.str("item")?);
    ctx.screen()
        .open_context_menu(&top, &bottom, &item, ctx.timeout(secs(10)), ctx.timeout(secs(60)))
}

fn wait(_: &mut ScenarioContext, args: &StepArgs<'_>) -> HarnessResult<()> {
    let max = args.u64("seconds")?;
    let seconds = match args.opt_u64("min")? {
        Some(min) if min > max => {
            return Err(HarnessError::usage(format!("min {min} is larger than seconds {max}")));
        }
        Some(min) => rand::random_range(min..=max),
        None => max,
    };
    info!(seconds, "sleeping");
    std::thread::sleep(secs(seconds));
    Ok(())
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

use ParamKind::{Bool, Duration as Dur, Int, Str};

const fn req(name: &'static str, kind: ParamKind) -> Param {
    Param::required(name, kind)
}

const fn opt(name: &'static str, kind: ParamKind) -> Param {
    Param::optional(name, kind)
}

const START_PARAMS: &[Param] = &[
    opt("dvd", Bool),
    opt("image", Str),
    opt("network_unplugged", Bool),
    opt("login", Bool),
];

const START_FROM_DRIVE_PARAMS: &[Param] = &[
    req("volume", Str),
    req("bus", Str),
    opt("network_unplugged", Bool),
    opt("login", Bool),
];

macro_rules! step {
    ($verb:literal, $handler:ident, $summary:literal, [$($param:expr),* $(,)?]) => {
        StepDefinition {
            verb: $verb,
            summary: $summary,
            params: {
                const PARAMS: &[Param] = &[$($param),*];
                PARAMS
            },
            handler: $handler,
        }
    };
    ($verb:literal, $handler:ident, $summary:literal, $params:expr) => {
        StepDefinition {
            verb: $verb,
            summary: $summary,
            params: $params,
            handler: $handler,
        }
    };
}

/// Every built-in step.
pub fn builtin_steps() -> Vec<StepDefinition> {
    vec![
        step!("a_computer", a_computer, "Define a fresh VM, destroying any previous one", []),
        step!("intend_ui_mode", intend_ui_mode, "Select gui or text installer landmarks", [req("mode", Str)]),
        step!("intend_boot_options", intend_boot_options, "Extra kernel command line typed at the boot menu", [req("options", Str)]),
        step!("boot_from_cdrom", boot_from_cdrom, "Boot from an ISO image", [req("image", Str)]),
        step!("boot_from_drive", boot_from_drive, "Boot from a volume on a bus", [req("volume", Str), req("bus", Str)]),
        step!("set_hardware_clock", set_hardware_clock, "Set the VM's hardware clock (VM off)", [req("time", Str)]),
        step!(
            "create_disk",
            create_disk,
            "Create a disk; temporary disks are deleted after the scenario",
            [opt("name", Str), req("size", Int), req("unit", Str), opt("format", Str), opt("temporary", Bool)]
        ),
        step!("plug_drive", plug_drive, "Plug a volume; waits for detection when running", [req("name", Str), req("bus", Str)]),
        step!("drive_detected", drive_detected, "Wait until the guest sees a plugged drive", [req("name", Str), opt("timeout", Dur)]),
        step!("network_plugged", network_plugged, "Plug the network link", []),
        step!("network_unplugged", network_unplugged, "Unplug the network link", []),
        step!("network_ready", network_ready, "Wait until the guest has network", [opt("timeout", Dur)]),
        step!("capture_traffic", capture_traffic, "Capture all traffic on the VM's link", []),
        step!("allowed_hosts", allowed_hosts, "Set the allowed endpoints (comma or newline separated)", [req("hosts", Str)]),
        step!("allowed_hosts_from_guest", allowed_hosts_from_guest, "Read allowed endpoints from a guest file", [req("path", Str)]),
        step!(
            "traffic_only_to_allowed_hosts",
            traffic_only_to_allowed_hosts,
            "Every connection went to an allowed endpoint",
            [opt("strict", Bool)]
        ),
        step!("lan_web_server", lan_web_server, "Run a web server on the LAN and allow it", [opt("expect", Str)]),
        step!("start_computer", start_computer, "Power on the VM", []),
        step!(
            "boot_system",
            boot_system,
            "Pass the boot menu and wait for the system and its remote shell",
            [opt("menu", Str), opt("ready", Str), opt("timeout", Dur)]
        ),
        step!("log_in", log_in, "Log in and wait for the desktop session", [opt("button", Str)]),
        step!("session_open", session_open, "Wait for a logind seat session", [opt("user", Str), opt("timeout", Dur)]),
        step!("start_system", start_system, "Plug network, start, boot and optionally log in", START_PARAMS),
        step!(
            "start_system_from_drive",
            start_system_from_drive,
            "Like start_system, booting from a drive",
            START_FROM_DRIVE_PARAMS
        ),
        step!("power_off", power_off, "Power off a running VM", []),
        step!("cold_reboot", cold_reboot, "Power off and start again", []),
        step!("warm_reboot", warm_reboot, "Ask the guest to reboot", []),
        step!("destroy_computer", destroy_computer, "Destroy and undefine the VM", []),
        step!("eject_boot_medium", eject_boot_medium, "Eject the boot CD-ROM or unplug the boot disk", []),
        step!("shuts_down_within", shuts_down_within, "Wait for the VM to power off", [req("minutes", Int)]),
        step!("shutdown_and_wait", shutdown_and_wait, "Ask the guest to power off and wait", []),
        step!("execute", execute, "Run a guest command and log its result", [req("command", Str), opt("user", Str)]),
        step!(
            "command_outcome",
            command_outcome,
            "Run a guest command expecting 'succeeds' or 'fails'",
            [req("command", Str), req("outcome", Str)]
        ),
        step!("process_running", process_running, "A guest process is running", [req("name", Str)]),
        step!("process_not_running", process_not_running, "A guest process is not running", [req("name", Str)]),
        step!(
            "process_running_within",
            process_running_within,
            "Wait for a guest process to appear",
            [req("name", Str), req("timeout", Dur)]
        ),
        step!(
            "process_stopped_within",
            process_stopped_within,
            "Wait for a guest process to go away",
            [req("name", Str), req("timeout", Dur)]
        ),
        step!("kill_process", kill_process, "killall a guest process and wait for it to go", [req("name", Str)]),
        step!("file_exists", file_exists, "A guest file exists, optionally after a wait", [req("path", Str), opt("timeout", Dur)]),
        step!("file_absent", file_absent, "A guest file does not exist", [req("path", Str)]),
        step!("directory_exists", directory_exists, "A guest directory exists", [req("path", Str)]),
        step!("directory_absent", directory_absent, "A guest directory does not exist", [req("path", Str)]),
        step!(
            "copy_file",
            copy_file,
            "Copy a guest file as a user",
            [req("source", Str), req("destination", Str), opt("user", Str)]
        ),
        step!("package_installed", package_installed, "A guest package is installed", [req("package", Str)]),
        step!("time_synchronized", time_synchronized, "Set the guest clock to the host's", []),
        step!("see", see, "A landmark shows up in time", [req("landmark", Str), req("timeout", Dur)]),
        step!("do_not_see", do_not_see, "A landmark does not show up in time", [req("landmark", Str), req("timeout", Dur)]),
        step!(
            "see_mode_screen",
            see_mode_screen,
            "An installer screen for the current UI mode shows up (or not)",
            [req("name", Str), req("timeout", Dur), opt("absent", Bool)]
        ),
        step!("type_text", type_text, "Type text", [req("text", Str)]),
        step!("press_key", press_key, "Press a key, e.g. ENTER, with optional modifiers", [req("key", Str), opt("modifiers", Str)]),
        step!(
            "context_menu",
            context_menu,
            "Right-click between two landmarks and pick a menu item",
            [req("top", Str), req("bottom", Str), req("item", Str)]
        ),
        step!("wait", wait, "Sleep N seconds, or a random time between min and N", [req("seconds", Int), opt("min", Int)]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::mock::{MockCapture, MockHypervisor, MockScreen};
    use crate::scenario::context::Backends;
    use crate::scenario::registry::{StepCall, StepRegistry};
    use crate::screen::Region;
    use crate::vm::VmState;
    use std::collections::HashSet;

    struct Fixture {
        hv: Arc<MockHypervisor>,
        screen: Arc<MockScreen>,
        capture: Arc<MockCapture>,
        ctx: ScenarioContext,
        registry: StepRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let hv = Arc::new(MockHypervisor::new());
            let screen = Arc::new(MockScreen::new(1024, 768));
            let capture = Arc::new(MockCapture::new());
            let config = HarnessConfig {
                poll_interval: Duration::from_millis(5),
                min_poll_sleep: Duration::from_millis(1),
                ..HarnessConfig::default()
            };
            let backends = Backends {
                hypervisor: hv.clone(),
                screen: screen.clone(),
                capture: capture.clone(),
            };
            Self {
                hv,
                screen,
                capture,
                ctx: ScenarioContext::new(config, backends, "steps"),
                registry: StepRegistry::with_builtin_steps(),
            }
        }

        fn run(&mut self, call: StepCall) -> HarnessResult<()> {
            self.registry.run(&mut self.ctx, &call)
        }

        fn running(mut self) -> Self {
            self.run(StepCall::new("a_computer")).unwrap();
            self.run(StepCall::new("start_computer")).unwrap();
            self
        }
    }

    #[test]
    fn test_verbs_unique_and_params_sane() {
        let steps = builtin_steps();
        let verbs: HashSet<_> = steps.iter().map(|s| s.verb).collect();
        assert_eq!(verbs.len(), steps.len());
        for step in &steps {
            let names: HashSet<_> = step.params.iter().map(|p| p.name).collect();
            assert_eq!(names.len(), step.params.len(), "{}", step.verb);
        }
    }

    #[test]
    fn test_steps_need_a_computer() {
        let mut f = Fixture::new();
        let err = f.run(StepCall::new("start_computer")).unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { .. }));
    }

    #[test]
    fn test_start_computer_twice() {
        let mut f = Fixture::new().running();
        assert!(matches!(
            f.run(StepCall::new("start_computer")),
            Err(HarnessError::InvalidState { .. })
        ));
        assert_eq!(f.ctx.vm().unwrap().state(), VmState::Running);
    }

    #[test]
    fn test_temporary_disk_deleted_at_teardown() {
        let mut f = Fixture::new();
        f.run(StepCall::new("a_computer")).unwrap();
        f.run(
            StepCall::new("create_disk")
                .with("name", "scratch")
                .with("size", 64)
                .with("unit", "MiB")
                .with("temporary", true),
        )
        .unwrap();
        f.run(StepCall::new("create_disk").with("name", "keep").with("size", 1).with("unit", "GiB"))
            .unwrap();
        let pool = f.ctx.vm().unwrap().storage().clone();
        assert!(pool.volume_exists("scratch").unwrap());

        let (_, result) = f.ctx.teardown();
        result.unwrap();
        assert!(!pool.volume_exists("scratch").unwrap());
        assert!(pool.volume_exists("keep").unwrap());
    }

    #[test]
    fn test_plug_drive_waits_for_detection() {
        let mut f = Fixture::new().running();
        f.run(StepCall::new("create_disk").with("name", "usb").with("size", 8).with("unit", "GiB"))
            .unwrap();
        f.run(StepCall::new("plug_drive").with("name", "usb").with("bus", "usb"))
            .unwrap();
        f.run(StepCall::new("drive_detected").with("name", "usb")).unwrap();
    }

    #[test]
    fn test_command_outcome() {
        let mut f = Fixture::new().running();
        f.run(StepCall::new("command_outcome").with("command", "true").with("outcome", "succeeds"))
            .unwrap();
        f.run(StepCall::new("command_outcome").with("command", "false").with("outcome", "fails"))
            .unwrap();
        assert!(matches!(
            f.run(StepCall::new("command_outcome").with("command", "false").with("outcome", "succeeds")),
            Err(HarnessError::CommandFailed { .. })
        ));
        assert!(matches!(
            f.run(StepCall::new("command_outcome").with("command", "true").with("outcome", "fails")),
            Err(HarnessError::Timeout { .. })
        ));
        assert!(matches!(
            f.run(StepCall::new("command_outcome").with("command", "true").with("outcome", "maybe")),
            Err(HarnessError::Usage(_))
        ));
    }

    #[test]
    fn test_process_steps() {
        let mut f = Fixture::new().running();
        f.hv.add_guest_process("steps", "tor");
        f.run(StepCall::new("process_running").with("name", "tor")).unwrap();
        assert!(f.run(StepCall::new("process_not_running").with("name", "tor")).is_err());
        f.run(StepCall::new("kill_process").with("name", "tor")).unwrap();
        f.run(StepCall::new("process_stopped_within").with("name", "tor").with("timeout", 1))
            .unwrap();
        let err = f
            .run(StepCall::new("process_running_within").with("name", "tor").with("timeout", "20ms"))
            .unwrap_err();
        assert!(err.to_string().contains("process 'tor' is not running"));
    }

    #[test]
    fn test_file_steps() {
        let mut f = Fixture::new().running();
        f.hv.add_guest_file("steps", "/home/user/notes.txt", "hi");
        f.run(StepCall::new("file_exists").with("path", "/home/user/notes.txt")).unwrap();
        f.run(StepCall::new("file_absent").with("path", "/home/user/other.txt")).unwrap();
        f.run(
            StepCall::new("copy_file")
                .with("source", "/home/user/notes.txt")
                .with("destination", "/tmp"),
        )
        .unwrap();
        f.run(StepCall::new("file_exists").with("path", "/tmp/notes.txt")).unwrap();
        f.run(StepCall::new("directory_exists").with("path", "/tmp")).unwrap();
        f.run(StepCall::new("directory_absent").with("path", "/nope")).unwrap();
        let copies: Vec<_> = f
            .hv
            .executed_commands("steps")
            .into_iter()
            .filter(|(_, cmd)| cmd.starts_with("cp "))
            .collect();
        assert_eq!(copies[0].0, "user");
    }

    #[test]
    fn test_package_installed() {
        let mut f = Fixture::new().running();
        f.hv.install_package("steps", "tor");
        f.run(StepCall::new("package_installed").with("package", "tor")).unwrap();
        assert!(f.run(StepCall::new("package_installed").with("package", "nginx")).is_err());
    }

    #[test]
    fn test_see_and_do_not_see() {
        let mut f = Fixture::new();
        f.screen.show("Desktop.png", Region::new(0, 0, 10, 10));
        f.run(StepCall::new("see").with("landmark", "Desktop.png").with("timeout", "20ms"))
            .unwrap();
        f.run(StepCall::new("do_not_see").with("landmark", "Error.png").with("timeout", "20ms"))
            .unwrap();
        assert!(matches!(
            f.run(StepCall::new("do_not_see").with("landmark", "Desktop.png").with("timeout", "20ms")),
            Err(HarnessError::StillPresent { .. })
        ));

        f.run(StepCall::new("intend_ui_mode").with("mode", "text")).unwrap();
        f.screen.show("d-i_text_Language.png", Region::new(0, 0, 10, 10));
        f.run(StepCall::new("see_mode_screen").with("name", "Language").with("timeout", 0))
            .unwrap();
    }

    #[test]
    fn test_session_open_matches_loginctl() {
        let mut f = Fixture::new().running();
        assert!(f
            .run(StepCall::new("session_open").with("timeout", "20ms"))
            .is_err());
        f.hv.open_session("steps", "user");
        f.run(StepCall::new("session_open").with("timeout", "1s")).unwrap();
    }

    #[test]
    fn test_start_system_composite() {
        let mut f = Fixture::new();
        f.screen.show("BootMenu.png", Region::new(0, 0, 10, 10));
        f.screen.reveal_on_key(Key::Enter, "Greeter.png", Region::new(0, 0, 10, 10));
        f.screen.show("LoginButton.png", Region::new(400, 300, 40, 20));
        f.hv.open_session("steps", "user");

        f.run(StepCall::new("a_computer")).unwrap();
        f.run(StepCall::new("intend_boot_options").with("options", "debug")).unwrap();
        f.run(StepCall::new("start_system").with("network_unplugged", true).with("login", true))
            .unwrap();

        assert_eq!(f.ctx.vm().unwrap().state(), VmState::Running);
        assert!(!f.ctx.vm().unwrap().has_network().unwrap());
        assert_eq!(f.screen.typed_text(), " debug");
    }

    #[test]
    fn test_start_system_surfaces_first_failure() {
        let mut f = Fixture::new();
        f.run(StepCall::new("a_computer")).unwrap();
        let err = f
            .run(StepCall::new("start_system").with("dvd", true))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Usage(_)));
        assert_eq!(f.ctx.vm().unwrap().state(), VmState::Defined);
    }

    #[test]
    fn test_shutdown_steps() {
        let mut f = Fixture::new().running();
        f.run(StepCall::new("shutdown_and_wait")).unwrap();
        assert_eq!(f.ctx.vm().unwrap().state(), VmState::Stopped);
        assert!(matches!(
            f.run(StepCall::new("power_off")),
            Err(HarnessError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_eject_boot_medium_step() {
        let mut f = Fixture::new();
        f.run(StepCall::new("a_computer")).unwrap();
        f.run(StepCall::new("boot_from_cdrom").with("image", "/srv/live.iso"))
            .unwrap();
        f.run(StepCall::new("start_computer")).unwrap();
        f.run(StepCall::new("eject_boot_medium")).unwrap();
        assert_eq!(f.hv.boot_source("steps"), None);
        assert!(matches!(
            f.run(StepCall::new("eject_boot_medium")),
            Err(HarnessError::Usage(_))
        ));
    }

    #[test]
    fn test_shuts_down_within_rejects_huge_minutes() {
        let mut f = Fixture::new().running();
        assert!(matches!(
            f.run(StepCall::new("shuts_down_within").with("minutes", i64::MAX)),
            Err(HarnessError::Usage(_))
        ));
        assert_eq!(f.ctx.vm().unwrap().state(), VmState::Running);
    }

    #[test]
    fn test_traffic_policy_steps() {
        let mut f = Fixture::new().running();
        f.hv.add_guest_file("steps", "/etc/relays", "# relays\n10.2.1.1:9050\n");
        f.run(StepCall::new("capture_traffic")).unwrap();
        f.run(StepCall::new("allowed_hosts_from_guest").with("path", "/etc/relays"))
            .unwrap();

        let flow = |daddr: [u8; 4], dport| crate::traffic::Flow {
            timestamp: Utc::now(),
            protocol: crate::traffic::Protocol::Tcp,
            source: "10.2.1.2".parse().unwrap(),
            daddr: std::net::IpAddr::from(daddr),
            dport,
        };
        f.capture.emit("vnet-steps", flow([10, 2, 1, 1], 9050));
        f.run(StepCall::new("traffic_only_to_allowed_hosts")).unwrap();

        f.capture.emit("vnet-steps", flow([93, 184, 216, 34], 80));
        match f.run(StepCall::new("traffic_only_to_allowed_hosts")).unwrap_err() {
            HarnessError::PolicyViolation { address, port } => {
                assert_eq!((address.as_str(), port), ("93.184.216.34", 80));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wait_bounds() {
        let mut f = Fixture::new();
        f.run(StepCall::new("wait").with("seconds", 0)).unwrap();
        f.run(StepCall::new("wait").with("seconds", 0).with("min", 0)).unwrap();
        assert!(matches!(
            f.run(StepCall::new("wait").with("seconds", 1).with("min", 2)),
            Err(HarnessError::Usage(_))
        ));
    }

    #[test]
    fn test_time_sync_runs_as_root() {
        let mut f = Fixture::new().running();
        f.run(StepCall::new("time_synchronized")).unwrap();
        assert!(f.hv.guest_clock("steps").is_some());
    }
}
