//! UI action script for the Dreamina web UI.
//!
//! Selectors target the lv-* component classes the site ships; the response
//! matchers cover the three background calls that matter: the generate
//! acknowledgement, the asset listing, and credit-balance reports.

use headless_chrome::protocol::cdp::DOM;
use headless_chrome::Tab;
use std::time::Duration;

use crate::models::account::Credential;
use crate::models::job::{GenerationJob, JobKind};
use crate::scripts::{ScriptError, UiScript};
use crate::services::correlator::{InterceptedResponse, ResponseMatchers};

const LOGIN_URL: &str = "https://dreamina.capcut.com/ai-tool/login";
const IMAGE_SURFACE_URL: &str = "https://dreamina.capcut.com/ai-tool/generate?type=image";
const VIDEO_SURFACE_URL: &str = "https://dreamina.capcut.com/ai-tool/generate?type=video";

/// Appears once the account header has loaded, i.e. we are authenticated.
const CREDIT_BADGE: &str = "div[class^='credit-amount-text-']";

/// Remote error code for an account without enough credits.
const QUOTA_REJECTED_CODE: i64 = -2001;

const LOGIN_WAIT: Duration = Duration::from_secs(60);
const PROBE_WAIT: Duration = Duration::from_secs(15);
const SUBMIT_WAIT: Duration = Duration::from_secs(60);

pub struct DreaminaScript;

impl DreaminaScript {
    fn select_model(&self, tab: &Tab, model: &str) -> Result<(), ScriptError> {
        tab.wait_for_element("div.lv-select[role='combobox']:not([class*='type-select-'])")
            .map_err(|e| ScriptError::new("open model picker", e))?
            .click()
            .map_err(|e| ScriptError::new("open model picker", e))?;
        tab.wait_for_element("div.lv-select-popup-inner[role='listbox']")
            .map_err(|e| ScriptError::new("model picker popup", e))?;

        let options = tab
            .find_elements("li[role='option'] [class*='option-label-']")
            .map_err(|e| ScriptError::new("list model options", e))?;
        for option in options {
            let label = option
                .get_inner_text()
                .map_err(|e| ScriptError::new("read model option", e))?;
            if label.trim() == model {
                option
                    .click()
                    .map_err(|e| ScriptError::new("pick model option", e))?;
                return Ok(());
            }
        }

        Err(ScriptError::new(
            "pick model option",
            format!("model {model:?} not offered"),
        ))
    }

    fn upload_inputs(&self, tab: &Tab, refs: &[String]) -> Result<(), ScriptError> {
        if refs.is_empty() {
            return Ok(());
        }

        let input = tab
            .wait_for_element("input[type='file'][accept*='image']")
            .map_err(|e| ScriptError::new("find upload input", e))?;
        tab.call_method(DOM::SetFileInputFiles {
            files: refs.to_vec(),
            node_id: None,
            backend_node_id: Some(input.backend_node_id),
            object_id: None,
        })
        .map_err(|e| ScriptError::new("attach reference inputs", e))?;
        Ok(())
    }
}

impl UiScript for DreaminaScript {
    fn site(&self) -> &'static str {
        "dreamina"
    }

    fn login_url(&self) -> &'static str {
        LOGIN_URL
    }

    fn surface_url(&self, kind: JobKind) -> &'static str {
        match kind {
            JobKind::Image => IMAGE_SURFACE_URL,
            JobKind::Video => VIDEO_SURFACE_URL,
        }
    }

    fn is_login_page(&self, url: &str) -> bool {
        url.contains("/ai-tool/login")
    }

    fn is_logged_in(&self, tab: &Tab) -> bool {
        tab.wait_for_element_with_custom_timeout(CREDIT_BADGE, PROBE_WAIT)
            .is_ok()
    }

    fn login(&self, tab: &Tab, credential: &Credential) -> Result<(), ScriptError> {
        // Keep the app-download modal from covering the form.
        tab.evaluate(
            r#"window.localStorage.setItem("app_download_modal_first_screen_shown", "true")"#,
            false,
        )
        .map_err(|e| ScriptError::new("suppress download modal", e))?;

        tab.wait_for_element(".lv-checkbox-mask")
            .map_err(|e| ScriptError::new("terms checkbox", e))?
            .click()
            .map_err(|e| ScriptError::new("terms checkbox", e))?;
        tab.wait_for_element("div[class^='login-button-']")
            .map_err(|e| ScriptError::new("login button", e))?
            .click()
            .map_err(|e| ScriptError::new("login button", e))?;

        tab.wait_for_element("[class*='lv_new_sign_in_panel']")
            .map_err(|e| ScriptError::new("sign-in panel", e))?;
        tab.wait_for_xpath("//span[text()='Continue with email']")
            .map_err(|e| ScriptError::new("continue with email", e))?
            .click()
            .map_err(|e| ScriptError::new("continue with email", e))?;

        tab.wait_for_element("input[placeholder='Enter email']")
            .map_err(|e| ScriptError::new("email field", e))?
            .type_into(&credential.email)
            .map_err(|e| ScriptError::new("email field", e))?;
        tab.wait_for_element("input[placeholder='Enter password']")
            .map_err(|e| ScriptError::new("password field", e))?
            .type_into(&credential.password)
            .map_err(|e| ScriptError::new("password field", e))?;
        tab.wait_for_element(".lv_new_sign_in_panel_wide-sign-in-button")
            .map_err(|e| ScriptError::new("sign-in submit", e))?
            .click()
            .map_err(|e| ScriptError::new("sign-in submit", e))?;

        // The credit badge only renders for an authenticated account.
        tab.wait_for_element_with_custom_timeout(CREDIT_BADGE, LOGIN_WAIT)
            .map_err(|e| ScriptError::new("post-login check", e))?;
        Ok(())
    }

    fn fill_and_submit(&self, tab: &Tab, job: &GenerationJob) -> Result<(), ScriptError> {
        tab.wait_for_element("textarea.lv-textarea")
            .map_err(|e| ScriptError::new("prompt field", e))?
            .type_into(&job.prompt)
            .map_err(|e| ScriptError::new("prompt field", e))?;

        if let Some(model) = job.params.model.as_deref() {
            self.select_model(tab, model)?;
        }

        if let Some(ratio) = job.params.ratio.as_deref() {
            // The ratio radio group is addressed by its visible label.
            tab.wait_for_element("button.lv-btn-secondary[class*='lv-btn-shape-square']")
                .map_err(|e| ScriptError::new("open ratio picker", e))?
                .click()
                .map_err(|e| ScriptError::new("open ratio picker", e))?;
            tab.wait_for_xpath(&format!(
                "//label[contains(@class,'lv-radio')][.//text()='{ratio}']"
            ))
            .map_err(|e| ScriptError::new("pick ratio", e))?
            .click()
            .map_err(|e| ScriptError::new("pick ratio", e))?;
        }

        self.upload_inputs(tab, &job.input_refs)?;

        // The button enables once the prompt and uploads are accepted; click
        // through JS because an overlay intermittently eats the direct click.
        tab.wait_for_element_with_custom_timeout(
            "button[class^='lv-btn lv-btn-primary'][class*='submit-button-']:not(.lv-btn-disabled)",
            SUBMIT_WAIT,
        )
        .map_err(|e| ScriptError::new("submit ready", e))?;
        tab.evaluate(
            r#"
            (() => {
                const button = document.querySelector(
                    "button[class^='lv-btn lv-btn-primary'][class*='submit-button-']:not(.lv-btn-disabled)"
                );
                if (button) { button.click(); return true; }
                return false;
            })()
            "#,
            false,
        )
        .map_err(|e| ScriptError::new("submit click", e))?;
        Ok(())
    }
}

impl ResponseMatchers for DreaminaScript {
    fn match_submission_ack(&self, response: &InterceptedResponse) -> Option<String> {
        if !response.url.contains("aigc_draft/generate") {
            return None;
        }
        if response.body["ret"].as_str() != Some("0") {
            return None;
        }
        response.body["data"]["aigc_data"]["task"]["task_id"]
            .as_str()
            .map(str::to_string)
    }

    fn match_completed_asset(
        &self,
        response: &InterceptedResponse,
        remote_id: &str,
    ) -> Option<Vec<String>> {
        if !response.url.contains("/v1/get_asset_list") {
            return None;
        }
        let asset_list = response.body["data"]["asset_list"].as_array()?;
        let entry = asset_list
            .iter()
            .find(|asset| asset["id"].as_str() == Some(remote_id))?;

        // Image and video entries carry the finish marker under their media
        // object; zero means still rendering.
        if entry["image"].is_object() {
            if entry["image"]["finish_time"].as_i64().unwrap_or(0) == 0 {
                return None;
            }
            let items = entry["image"]["item_list"].as_array();
            return Some(
                items
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|item| {
                                item["image"]["large_images"][0]["image_url"]
                                    .as_str()
                                    .map(str::to_string)
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            );
        }

        if entry["video"].is_object() {
            if entry["video"]["finish_time"].as_i64().unwrap_or(0) == 0 {
                return None;
            }
            return Some(
                entry["video"]["transcoded_video"]["origin"]["video_url"]
                    .as_str()
                    .map(|url| vec![url.to_string()])
                    .unwrap_or_default(),
            );
        }

        None
    }

    fn match_quota_rejection(&self, response: &InterceptedResponse) -> bool {
        if !response.url.contains("aigc_draft/generate") {
            return false;
        }
        response.body["code"].as_i64() == Some(QUOTA_REJECTED_CODE)
            || response.body["ret"].as_str() == Some("-2001")
    }

    fn match_credit_balance(&self, response: &InterceptedResponse) -> Option<i64> {
        if !response.url.contains("credit") {
            return None;
        }
        let credit = &response.body["data"]["credit"];
        if let Some(total) = credit["total_credit"].as_i64() {
            return Some(total);
        }
        if credit.is_object() {
            let parts = ["gift_credit", "purchase_credit", "vip_credit"];
            if parts.iter().any(|p| credit[p].is_i64()) {
                return Some(parts.iter().filter_map(|p| credit[p].as_i64()).sum());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(url: &str, body: serde_json::Value) -> InterceptedResponse {
        InterceptedResponse {
            url: url.to_string(),
            body,
        }
    }

    #[test]
    fn ack_requires_the_generate_call_and_ret_zero() {
        let script = DreaminaScript;
        let ok = response(
            "https://dreamina.capcut.com/mweb/v1/aigc_draft/generate?aid=1",
            json!({"ret": "0", "data": {"aigc_data": {"task": {"task_id": "7491"}}}}),
        );
        assert_eq!(script.match_submission_ack(&ok).as_deref(), Some("7491"));

        let wrong_ret = response(
            "https://dreamina.capcut.com/mweb/v1/aigc_draft/generate?aid=1",
            json!({"ret": "1015", "data": {}}),
        );
        assert_eq!(script.match_submission_ack(&wrong_ret), None);

        let wrong_url = response(
            "https://dreamina.capcut.com/mweb/v1/other",
            json!({"ret": "0", "data": {"aigc_data": {"task": {"task_id": "7491"}}}}),
        );
        assert_eq!(script.match_submission_ack(&wrong_url), None);
    }

    #[test]
    fn image_completion_yields_up_to_four_large_images() {
        let script = DreaminaScript;
        let listing = response(
            "https://dreamina.capcut.com/mweb/v1/get_asset_list",
            json!({"data": {"asset_list": [
                {"id": "other", "image": {"finish_time": 1, "item_list": []}},
                {"id": "7491", "image": {"finish_time": 1736000000, "item_list": [
                    {"image": {"large_images": [{"image_url": "https://cdn/a.webp"}]}},
                    {"image": {"large_images": [{"image_url": "https://cdn/b.webp"}]}},
                ]}},
            ]}}),
        );

        let outputs = script.match_completed_asset(&listing, "7491").unwrap();
        assert_eq!(outputs, vec!["https://cdn/a.webp", "https://cdn/b.webp"]);
    }

    #[test]
    fn unfinished_assets_do_not_match() {
        let script = DreaminaScript;
        let listing = response(
            "https://dreamina.capcut.com/mweb/v1/get_asset_list",
            json!({"data": {"asset_list": [
                {"id": "7491", "image": {"finish_time": 0, "item_list": []}},
            ]}}),
        );
        assert_eq!(script.match_completed_asset(&listing, "7491"), None);
    }

    #[test]
    fn finished_without_parseable_urls_is_an_empty_match() {
        let script = DreaminaScript;
        let listing = response(
            "https://dreamina.capcut.com/mweb/v1/get_asset_list",
            json!({"data": {"asset_list": [
                {"id": "7491", "image": {"finish_time": 1736000000}},
            ]}}),
        );
        assert_eq!(script.match_completed_asset(&listing, "7491"), Some(vec![]));
    }

    #[test]
    fn video_completion_yields_the_transcoded_url() {
        let script = DreaminaScript;
        let listing = response(
            "https://dreamina.capcut.com/mweb/v1/get_asset_list",
            json!({"data": {"asset_list": [
                {"id": "8800", "video": {"finish_time": 1736000001, "transcoded_video": {
                    "origin": {"video_url": "https://cdn/clip.mp4"}
                }}},
            ]}}),
        );
        assert_eq!(
            script.match_completed_asset(&listing, "8800"),
            Some(vec!["https://cdn/clip.mp4".to_string()])
        );
    }

    #[test]
    fn quota_rejection_matches_the_remote_code() {
        let script = DreaminaScript;
        let rejected = response(
            "https://dreamina.capcut.com/mweb/v1/aigc_draft/generate",
            json!({"code": -2001, "message": "insufficient credit"}),
        );
        assert!(script.match_quota_rejection(&rejected));

        let fine = response(
            "https://dreamina.capcut.com/mweb/v1/aigc_draft/generate",
            json!({"ret": "0"}),
        );
        assert!(!script.match_quota_rejection(&fine));
    }

    #[test]
    fn credit_balance_sums_the_credit_buckets() {
        let script = DreaminaScript;
        let report = response(
            "https://dreamina.capcut.com/commerce/v1/benefits/user_credit",
            json!({"data": {"credit": {"gift_credit": 10, "purchase_credit": 20, "vip_credit": 5}}}),
        );
        assert_eq!(script.match_credit_balance(&report), Some(35));

        let total = response(
            "https://dreamina.capcut.com/commerce/v1/benefits/user_credit",
            json!({"data": {"credit": {"total_credit": 66}}}),
        );
        assert_eq!(script.match_credit_balance(&total), Some(66));
    }
}
