//! JavaScript snippets evaluated in the page or inside an isolated frame
//! context. Every builder returns a self-invoking expression.

use crate::surface::FieldEvent;

/// Encode a string as a JavaScript string literal.
pub fn js_str(s: &str) -> String {
    serde_json::Value::String(s.to_owned()).to_string()
}

/// Platform value setter lookup.
///
/// Frameworks that track input state (React and friends) install their own
/// `value` property on the element instance and ignore plain assignment.
/// The setter on the element's prototype is the browser's own and bypasses
/// that override. This depends on the environment exposing the standard
/// `HTMLInputElement` / `HTMLTextAreaElement` / `HTMLSelectElement`
/// prototypes, which both the main world and isolated worlds do.
const NATIVE_SETTER: &str = r#"
    const nativeSet = (el, value) => {
        const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype
            : el instanceof HTMLSelectElement ? HTMLSelectElement.prototype
            : HTMLInputElement.prototype;
        const desc = Object.getOwnPropertyDescriptor(proto, 'value');
        if (desc && desc.set) { desc.set.call(el, value); } else { el.value = value; }
    };"#;

const EVENTS: &str = r#"
    const fire = (el, kind, data) => {
        switch (kind) {
            case 'focus':
                el.focus();
                el.dispatchEvent(new FocusEvent('focus'));
                el.dispatchEvent(new FocusEvent('focusin', { bubbles: true }));
                break;
            case 'input':
                el.dispatchEvent(new InputEvent('input', { bubbles: true, data, inputType: 'insertText' }));
                break;
            case 'change':
                el.dispatchEvent(new Event('change', { bubbles: true }));
                break;
            case 'blur':
                el.dispatchEvent(new FocusEvent('blur'));
                el.dispatchEvent(new FocusEvent('focusout', { bubbles: true }));
                el.blur();
                break;
        }
    };"#;

/// Describe an element: `{ found: false }` when absent, otherwise
/// `{ found: true, rendered, enabled, value }`.
///
/// "Rendered" means a non-zero layout box, so `display: none`, collapsed
/// and `visibility: hidden` elements are reported as not rendered.
pub fn probe(selector: &str) -> String {
    format!(
        r#"(() => {{
    const el = document.querySelector({sel});
    if (!el) return {{ found: false }};
    const rect = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    const rendered = rect.width > 0 && rect.height > 0
        && el.getClientRects().length > 0
        && style.visibility !== 'hidden';
    const enabled = !el.disabled && el.getAttribute('aria-disabled') !== 'true';
    const value = typeof el.value === 'string' ? el.value : '';
    return {{ found: true, rendered, enabled, value }};
}})()"#,
        sel = js_str(selector)
    )
}

/// Write `value` through the platform setter. Evaluates to `false` when the
/// element is missing.
pub fn set_native_value(selector: &str, value: &str) -> String {
    format!(
        r#"(() => {{{NATIVE_SETTER}
    const el = document.querySelector({sel});
    if (!el) return false;
    nativeSet(el, {val});
    return true;
}})()"#,
        sel = js_str(selector),
        val = js_str(value)
    )
}

/// Dispatch one field event. Evaluates to `false` when the element is missing.
pub fn dispatch(selector: &str, event: &FieldEvent) -> String {
    let data = match event {
        FieldEvent::Input(data) => js_str(data),
        _ => "null".to_string(),
    };
    format!(
        r#"(() => {{{EVENTS}
    const el = document.querySelector({sel});
    if (!el) return false;
    fire(el, {kind}, {data});
    return true;
}})()"#,
        sel = js_str(selector),
        kind = js_str(event.kind()),
    )
}

/// Current value of a control as `{ found, value }`.
pub fn read_value(selector: &str) -> String {
    format!(
        r#"(() => {{
    const el = document.querySelector({sel});
    if (!el) return {{ found: false }};
    return {{ found: true, value: String(el.value ?? '') }};
}})()"#,
        sel = js_str(selector)
    )
}

/// Whole injection sequence in one evaluation, for use inside a frame.
///
/// Evaluates to `{ found: false }` when the control is absent, otherwise
/// `{ found: true, value }` with the value read back after `settleMs`.
pub fn frame_fill(selector: &str, value: &str, settle_ms: u64) -> String {
    format!(
        r#"(async () => {{{NATIVE_SETTER}{EVENTS}
    const el = document.querySelector({sel});
    if (!el) return {{ found: false }};
    const value = {val};
    fire(el, 'focus', null);
    for (let i = 1; i <= value.length; i++) {{
        nativeSet(el, value.slice(0, i));
        fire(el, 'input', value[i - 1]);
    }}
    fire(el, 'change', null);
    fire(el, 'blur', null);
    await new Promise(r => setTimeout(r, {settle_ms}));
    return {{ found: true, value: String(el.value ?? '') }};
}})()"#,
        sel = js_str(selector),
        val = js_str(value),
    )
}

/// Report subtree mutations through the page binding `binding`, at most
/// once per microtask. Installing twice in one document is a no-op.
pub fn mutation_observer(binding: &str) -> String {
    format!(
        r#"(() => {{
    const name = {name};
    const key = '__observer_' + name;
    if (window[key]) return true;
    let queued = false;
    const observer = new MutationObserver(() => {{
        if (queued) return;
        queued = true;
        queueMicrotask(() => {{
            queued = false;
            try {{ window[name](''); }} catch (_) {{}}
        }});
    }});
    const start = () => observer.observe(document.documentElement || document, {{
        subtree: true, childList: true, attributes: true, characterData: true,
    }});
    if (document.documentElement) start();
    else document.addEventListener('DOMContentLoaded', start, {{ once: true }});
    window[key] = observer;
    return true;
}})()"#,
        name = js_str(binding),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_str_escapes() {
        assert_eq!(js_str(r#"a"b"#), r#""a\"b""#);
        assert_eq!(js_str("line\nbreak"), r#""line\nbreak""#);
    }

    #[test]
    fn test_native_setter_uses_prototype() {
        let js = set_native_value("#email", "a@x");
        assert!(js.contains("Object.getOwnPropertyDescriptor(proto, 'value')"));
        assert!(js.contains(r##"document.querySelector("#email")"##));
        assert!(js.contains(r#"nativeSet(el, "a@x")"#));
    }

    #[test]
    fn test_dispatch_carries_input_data() {
        let js = dispatch("#email", &FieldEvent::Input("a".into()));
        assert!(js.contains(r#"fire(el, "input", "a")"#));
        let js = dispatch("#email", &FieldEvent::Blur);
        assert!(js.contains(r#"fire(el, "blur", null)"#));
    }

    #[test]
    fn test_selector_injection_is_quoted() {
        let js = probe(r#"input[name="x"]'); alert(1); ('"#);
        assert!(js.contains(r#"document.querySelector("input[name=\"x\"]'); alert(1); ('")"#));
    }

    #[test]
    fn test_frame_fill_settles() {
        let js = frame_fill("#cvc", "123", 250);
        assert!(js.contains("setTimeout(r, 250)"));
        assert!(js.starts_with("(async () =>"));
    }

    #[test]
    fn test_mutation_observer_reports_through_binding() {
        let js = mutation_observer("__mutated");
        assert!(js.contains(r#"const name = "__mutated";"#));
        assert!(js.contains("subtree: true"));
        assert!(js.contains("window[name]('')"));
    }
}
