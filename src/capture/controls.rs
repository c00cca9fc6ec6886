//! Device control actions, run under the device lock.

use std::fmt::Write as _;
use std::io;
use std::mem;
use std::os::raw::c_void;

use tracing::{debug, warn};
use v4l::control::{Description, Flags, Type};
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::v4l2_control;
use v4l::Device;

use super::device::CaptureDevice;
use super::v4l2::V4l2Source;
use crate::error::{CaptureError, Result};

/// An operation on the raw device: writes its textual result into the
/// buffer, parameterized by a control id and a value.
pub type ControlAction = fn(&Device, &mut String, u32, i64) -> io::Result<()>;

/// Run `action` against the device, serialized with capture.
pub fn run_control(
    device: &CaptureDevice<V4l2Source>,
    action: ControlAction,
    id: u32,
    value: i64,
) -> Result<String> {
    device.with_device(|source| {
        let mut out = String::new();
        action(source.device(), &mut out, id, value)
            .map(|()| out)
            .map_err(|e| CaptureError::device("control", e))
    })?
}

fn ctrl_ioctl(device: &Device, request_get: bool, ctrl: &mut v4l2_control) -> io::Result<()> {
    let request = if request_get {
        vidioc::VIDIOC_G_CTRL
    } else {
        vidioc::VIDIOC_S_CTRL
    };
    let fd = device.handle().fd();
    loop {
        let res = unsafe {
            v4l2::ioctl(fd, request, &mut *ctrl as *mut v4l2_control as *mut c_void)
        };
        match res {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn get_value(device: &Device, id: u32) -> io::Result<i32> {
    // SAFETY: plain old data.
    let mut ctrl: v4l2_control = unsafe { mem::zeroed() };
    ctrl.id = id;
    ctrl_ioctl(device, true, &mut ctrl)?;
    Ok(ctrl.value)
}

/// Set control `id` to `value`. Failures end up in the text, the device
/// stays usable.
pub fn set_control(device: &Device, out: &mut String, id: u32, value: i64) -> io::Result<()> {
    if let Err(e) = get_value(device, id) {
        warn!("set_control failed to check value of {}: {}", id, e);
        let _ = writeln!(out, "failed to check value: {}", e);
        return Ok(());
    }

    let mut ctrl: v4l2_control = unsafe { mem::zeroed() };
    ctrl.id = id;
    ctrl.value = value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
    if let Err(e) = ctrl_ioctl(device, false, &mut ctrl) {
        warn!("set_control failed to set {} to {}: {}", id, value, e);
        let _ = writeln!(out, "failed to set value: {}", e);
        return Ok(());
    }
    out.push_str("OK");
    Ok(())
}

/// Render every enabled control as XML.
pub fn list_controls(device: &Device, out: &mut String, _id: u32, _value: i64) -> io::Result<()> {
    let descriptions = device.query_controls()?;

    out.push_str("<?xml version=\"1.0\" ?>\n<controls>\n");
    for desc in &descriptions {
        if desc.flags.contains(Flags::DISABLED) {
            continue;
        }
        let current = match get_value(device, desc.id) {
            Ok(value) => i64::from(value),
            Err(e) => {
                debug!("failed to get {} value: {}", desc.name, e);
                0
            }
        };
        render_control(out, &ControlEntry::from_description(desc, current));
    }
    out.push_str("</controls>\n");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Boolean,
    Range,
    Menu,
    Other,
}

struct ControlEntry<'a> {
    kind: Kind,
    name: &'a str,
    cid: u32,
    minimum: i64,
    maximum: i64,
    step: i64,
    default: i64,
    current: i64,
    flags: u32,
}

impl<'a> ControlEntry<'a> {
    #[allow(clippy::unnecessary_cast)]
    fn from_description(desc: &'a Description, current: i64) -> Self {
        let kind = match desc.typ {
            Type::Boolean => Kind::Boolean,
            Type::Integer => Kind::Range,
            Type::Menu => Kind::Menu,
            _ => Kind::Other,
        };
        Self {
            kind,
            name: &desc.name,
            cid: desc.id,
            minimum: desc.minimum as i64,
            maximum: desc.maximum as i64,
            step: desc.step as i64,
            default: desc.default as i64,
            current,
            flags: desc.flags.bits(),
        }
    }
}

const FLAG_ATTRIBUTES: [(Flags, &str); 6] = [
    (Flags::DISABLED, "disabled"),
    (Flags::GRABBED, "grabbed"),
    (Flags::READ_ONLY, "readonly"),
    (Flags::UPDATE, "update"),
    (Flags::INACTIVE, "inactive"),
    (Flags::SLIDER, "slider"),
];

fn render_control(out: &mut String, entry: &ControlEntry<'_>) {
    let name = escape(entry.name);
    // Writing into a String cannot fail.
    let _ = match entry.kind {
        Kind::Menu => writeln!(out, "<menu_control name=\"{}\" />", name),
        Kind::Boolean => writeln!(
            out,
            "<boolean_control name=\"{}\" default=\"{}\" current=\"{}\" cid=\"{}\" />",
            name, entry.default, entry.current, entry.cid
        ),
        Kind::Range => {
            let _ = write!(
                out,
                "<range_control name=\"{}\" minimum=\"{}\" maximum=\"{}\" by=\"{}\" default=\"{}\" current=\"{}\" cid=\"{}\"",
                name, entry.minimum, entry.maximum, entry.step, entry.default, entry.current, entry.cid
            );
            for (flag, attr) in FLAG_ATTRIBUTES {
                if entry.flags & flag.bits() != 0 {
                    let _ = write!(out, " {}=\"1\"", attr);
                }
            }
            writeln!(out, " />")
        }
        Kind::Other => {
            debug!("unhandled control type for {}", entry.name);
            Ok(())
        }
    };
}

fn escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}
