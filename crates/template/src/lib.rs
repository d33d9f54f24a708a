//! Template Renderer (C3): merge-tag rendering, Strict/Lax
//! modes, click-link rewriting, and open-pixel injection. Sits above
//! `campaign-core` the same way the teacher's `kumo-template` sits above
//! `message` — consumers pass in a `RenderContext` and get back rendered
//! subject/html/text plus any warnings.
pub mod context;
pub mod engine;
pub mod linking;
pub mod payload;

pub use context::RenderContext;
pub use engine::{render, RenderMode, RenderOutput};
pub use linking::{inject_open_pixel, rewrite_links};
pub use payload::{decode_and_verify, encode_and_sign, peek_tenant_id, PayloadError, TrackingFields};

/// A fully rendered message body: subject/html/text each carry their own
/// warnings since a template may only populate a subset of these fields.
#[derive(Debug, Clone, Default)]
pub struct RenderedMessage {
    pub subject: RenderOutput,
    pub html: Option<RenderOutput>,
    pub text: Option<RenderOutput>,
}

/// Renders a campaign's subject/html/text bodies against `ctx`, then
/// rewrites links and injects the open pixel into the html body when
/// tracking is enabled. This is the single entry point `enqueue` (C5)
/// calls per recipient.
#[allow(clippy::too_many_arguments)]
pub fn render_message(
    subject_source: &str,
    html_source: Option<&str>,
    text_source: Option<&str>,
    ctx: &RenderContext,
    mode: RenderMode,
    fields: &TrackingFields,
    hmac_key: &str,
    tracking_base: &str,
    tracking_enabled: bool,
) -> anyhow::Result<RenderedMessage> {
    let subject = engine::render(subject_source, ctx, mode)?;

    let html = html_source
        .map(|src| -> anyhow::Result<RenderOutput> {
            let mut out = engine::render(src, ctx, mode)?;
            if tracking_enabled {
                out.text = inject_open_pixel(
                    &rewrite_links(&out.text, fields, hmac_key, tracking_base),
                    fields,
                    hmac_key,
                    tracking_base,
                );
            }
            Ok(out)
        })
        .transpose()?;

    let text = text_source
        .map(|src| engine::render(src, ctx, mode))
        .transpose()?;

    Ok(RenderedMessage { subject, html, text })
}
