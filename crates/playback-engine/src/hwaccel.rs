// crates/playback-engine/src/hwaccel.rs
//
// Hardware-accelerated decode: attach an FFmpeg hw device context to a video
// codec context, and transfer decoded frames back to system memory when the
// caller needs pixel access rather than a GPU handle. Falls back silently to
// software decode on any setup failure — the caller only finds out via
// `HwAccelContext::is_active`.

use std::ptr;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::ffi;
use tracing::{debug, warn};

use playback_types::HwAccel;

/// The subset of `AVHWDeviceType` worth trying during auto-probe, roughly in
/// order of how commonly they're the "free" accelerator on their platform.
const AUTO_PROBE_ORDER: &[ffi::AVHWDeviceType] = &[
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
    ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VDPAU,
];

/// A successfully-initialized hw device context, owned for the lifetime of
/// one video decoder. Dropping it releases the underlying `AVBufferRef`.
pub struct HwAccelContext {
    device_ctx: *mut ffi::AVBufferRef,
    device_type: ffi::AVHWDeviceType,
    hw_pix_fmt: ffi::AVPixelFormat,
    transfer_to_host: bool,
}

unsafe impl Send for HwAccelContext {}

impl HwAccelContext {
    /// Try to build a context per `accel`. Returns `None` if `accel` is
    /// `HwAccel::None`, or if every candidate device type fails to open —
    /// never an error, since software decode is always a valid fallback.
    pub fn try_new(accel: HwAccel, device_index: i32, require_system_memory: bool) -> Option<Self> {
        match accel {
            HwAccel::None => None,
            HwAccel::Auto => {
                for &kind in AUTO_PROBE_ORDER {
                    if let Some(ctx) = Self::open(kind, device_index, require_system_memory) {
                        return Some(ctx);
                    }
                }
                debug!("hwaccel auto-probe exhausted every candidate, falling back to software");
                None
            }
            HwAccel::Specific(raw) => {
                let kind = ffi::AVHWDeviceType(raw);
                Self::open(kind, device_index, require_system_memory)
            }
        }
    }

    fn open(kind: ffi::AVHWDeviceType, device_index: i32, require_system_memory: bool) -> Option<Self> {
        if kind == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            return None;
        }
        let device_str = if device_index > 0 {
            Some(std::ffi::CString::new(device_index.to_string()).ok()?)
        } else {
            None
        };
        let device_ptr = device_str.as_ref().map(|s| s.as_ptr()).unwrap_or(ptr::null());

        let mut device_ctx: *mut ffi::AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(&mut device_ctx, kind, device_ptr, ptr::null_mut(), 0)
        };
        if ret < 0 {
            debug!(?kind, ret, "hwdevice open failed");
            return None;
        }

        let hw_pix_fmt = hw_pixel_format_for(kind);
        debug!(?kind, "hwaccel device opened");
        Some(Self {
            device_ctx,
            device_type: kind,
            hw_pix_fmt,
            transfer_to_host: require_system_memory,
        })
    }

    /// Attach this context to `codec_ctx`, wiring the decoder's `get_format`
    /// callback so FFmpeg negotiates the hw pixel format instead of falling
    /// back to a software one. Must be called before `open_as` on the
    /// decoder.
    pub fn attach(&self, codec_ctx: &mut ffmpeg::codec::context::Context) {
        unsafe {
            let raw = codec_ctx.as_mut_ptr();
            (*raw).hw_device_ctx = ffi::av_buffer_ref(self.device_ctx);
            (*raw).get_format = Some(get_hw_format);
            HW_PIX_FMT.with(|cell| cell.set(self.hw_pix_fmt));
        }
    }

    pub fn device_type(&self) -> ffi::AVHWDeviceType {
        self.device_type
    }

    pub fn is_transfer_to_host_required(&self) -> bool {
        self.transfer_to_host
    }

    /// Copy a decoded GPU frame into a freshly allocated system-memory frame.
    /// A frame with no `hw_frames_ctx` (i.e. already in system memory) is
    /// returned unchanged via `Ok(None)`, signaling the caller should keep
    /// using the original.
    pub fn transfer_to_host(
        frame: &ffmpeg::util::frame::video::Video,
    ) -> Result<Option<ffmpeg::util::frame::video::Video>, String> {
        let is_hw = unsafe { !(*frame.as_ptr()).hw_frames_ctx.is_null() };
        if !is_hw {
            return Ok(None);
        }
        let mut host = ffmpeg::util::frame::video::Video::empty();
        let ret = unsafe { ffi::av_hwframe_transfer_data(host.as_mut_ptr(), frame.as_ptr(), 0) };
        if ret < 0 {
            return Err(format!("av_hwframe_transfer_data failed: {ret}"));
        }
        unsafe {
            (*host.as_mut_ptr()).pts = (*frame.as_ptr()).pts;
        }
        Ok(Some(host))
    }
}

impl Drop for HwAccelContext {
    fn drop(&mut self) {
        unsafe {
            ffi::av_buffer_unref(&mut self.device_ctx);
        }
    }
}

thread_local! {
    /// `get_format` is a C callback with no user-data slot; we stash the
    /// negotiated hw pixel format here immediately before attaching so the
    /// callback (invoked synchronously on this thread during decode setup)
    /// can read it back.
    static HW_PIX_FMT: std::cell::Cell<ffi::AVPixelFormat> =
        std::cell::Cell::new(ffi::AVPixelFormat::AV_PIX_FMT_NONE);
}

unsafe extern "C" fn get_hw_format(
    _ctx: *mut ffi::AVCodecContext,
    pix_fmts: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    let wanted = HW_PIX_FMT.with(|cell| cell.get());
    let mut p = pix_fmts;
    while *p != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
        if *p == wanted {
            return *p;
        }
        p = p.add(1);
    }
    warn!("hwaccel pixel format not offered by decoder, falling back to software format");
    *pix_fmts
}

fn hw_pixel_format_for(kind: ffi::AVHWDeviceType) -> ffi::AVPixelFormat {
    use ffi::AVHWDeviceType::*;
    use ffi::AVPixelFormat::*;
    match kind {
        AV_HWDEVICE_TYPE_VIDEOTOOLBOX => AV_PIX_FMT_VIDEOTOOLBOX,
        AV_HWDEVICE_TYPE_D3D11VA => AV_PIX_FMT_D3D11,
        AV_HWDEVICE_TYPE_DXVA2 => AV_PIX_FMT_DXVA2_VLD,
        AV_HWDEVICE_TYPE_CUDA => AV_PIX_FMT_CUDA,
        AV_HWDEVICE_TYPE_VAAPI => AV_PIX_FMT_VAAPI,
        AV_HWDEVICE_TYPE_VDPAU => AV_PIX_FMT_VDPAU,
        _ => AV_PIX_FMT_NONE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_never_opens_a_device() {
        assert!(HwAccelContext::try_new(HwAccel::None, 0, false).is_none());
    }

    #[test]
    fn hw_pixel_format_lookup_is_total() {
        assert_eq!(
            hw_pixel_format_for(ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE),
            ffi::AVPixelFormat::AV_PIX_FMT_NONE
        );
        assert_ne!(
            hw_pixel_format_for(ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI),
            ffi::AVPixelFormat::AV_PIX_FMT_NONE
        );
    }
}
