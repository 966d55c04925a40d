//! Language detection and localized client-facing messages.
//!
//! Detection is best-effort: a handful of Unicode-block probes cover the
//! scripts we can identify cheaply, `whatlang` widens coverage for Latin and
//! Cyrillic languages, and anything unrecognized resolves to English.

use once_cell::sync::Lazy;
use regex::Regex;

/// Language codes with a translated message catalog.
pub const SUPPORTED_LANGUAGES: &[&str] = &[
    "en", "zh", "vi", "ja", "ko", "ru", "ar", "fr", "de", "es", "pt",
];

static SCRIPT_PROBES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        // CJK unified ideographs
        ("zh", Regex::new(r"[\u{4e00}-\u{9fff}]").unwrap()),
        // Vietnamese-specific precomposed letters
        (
            "vi",
            Regex::new(r"[\u{0102}\u{0103}\u{0110}\u{0111}\u{0128}\u{0129}\u{0168}\u{0169}\u{01a0}\u{01a1}\u{01af}\u{01b0}]")
                .unwrap(),
        ),
        // Hiragana and katakana
        ("ja", Regex::new(r"[\u{3040}-\u{309f}\u{30a0}-\u{30ff}]").unwrap()),
        // Hangul syllables
        ("ko", Regex::new(r"[\u{ac00}-\u{d7af}]").unwrap()),
        // Cyrillic
        ("ru", Regex::new(r"[\u{0400}-\u{04ff}]").unwrap()),
        // Arabic
        ("ar", Regex::new(r"[\u{0600}-\u{06ff}]").unwrap()),
    ]
});

/// Detect the language of `text`, returning a supported code (default `en`).
pub fn detect_language(text: &str) -> String {
    if text.is_empty() {
        return "en".to_string();
    }

    for (code, probe) in SCRIPT_PROBES.iter() {
        if probe.is_match(text) {
            tracing::debug!(language = code, "script probe matched");
            return (*code).to_string();
        }
    }

    if let Some(info) = whatlang::detect(text) {
        if info.is_reliable() {
            let code = whatlang_code(info.lang());
            tracing::debug!(language = code, confidence = info.confidence(), "whatlang detection");
            return code.to_string();
        }
    }

    "en".to_string()
}

/// Normalize an arbitrary language tag into a supported code.
///
/// Regional aliases collapse to their base language; anything outside the
/// supported set maps to `en`.
pub fn normalize_lang_code(tag: &str) -> String {
    if tag.is_empty() {
        return "en".to_string();
    }
    let lower = tag.to_ascii_lowercase();
    let base = match lower.as_str() {
        "zh-cn" | "zh-tw" => "zh",
        "pt-br" | "pt-pt" => "pt",
        "en-us" | "en-gb" => "en",
        other => other.split('-').next().unwrap_or("en"),
    };
    if SUPPORTED_LANGUAGES.contains(&base) {
        base.to_string()
    } else {
        "en".to_string()
    }
}

fn whatlang_code(lang: whatlang::Lang) -> &'static str {
    use whatlang::Lang;
    match lang {
        Lang::Eng => "en",
        Lang::Cmn => "zh",
        Lang::Vie => "vi",
        Lang::Jpn => "ja",
        Lang::Kor => "ko",
        Lang::Rus => "ru",
        Lang::Ara => "ar",
        Lang::Fra => "fr",
        Lang::Deu => "de",
        Lang::Spa => "es",
        Lang::Por => "pt",
        _ => "en",
    }
}

/// Keys into the localized message catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKey {
    PromptBlocked,
    PromptBlockedDetail,
    ResponseBlocked,
    ServerError,
    UpstreamError,
    ServerBusy,
    RequestTimeout,
    QueueFull,
}

/// Look up the message for `key` in `language`, substituting `reason` into
/// messages that carry a reason slot. Unknown languages fall back to English.
pub fn localized_message(key: MessageKey, language: &str, reason: Option<&str>) -> String {
    let template = catalog(language, key);
    match reason {
        Some(r) if template.contains("{reason}") => template.replace("{reason}", r),
        _ => template.replace("{reason}", "").trim_end().to_string(),
    }
}

fn catalog(language: &str, key: MessageKey) -> &'static str {
    use MessageKey::*;
    match language {
        "zh" => match key {
            PromptBlocked => "您的输入因安全扫描被阻止。原因：{reason}",
            PromptBlockedDetail => "输入包含不安全内容，无法处理。",
            ResponseBlocked => "模型输出被安全扫描阻止。",
            ServerError => "内部服务器错误。",
            UpstreamError => "上游服务发生错误。",
            ServerBusy => "服务器正忙，请稍后再试。",
            RequestTimeout => "请求超时，请稍后或缩短提示重试。",
            QueueFull => "请求队列已满，服务器过载。",
        },
        "vi" => match key {
            PromptBlocked => "Yêu cầu của bạn đã bị chặn bởi trình quét bảo mật. Lý do: {reason}",
            PromptBlockedDetail => "Nội dung không an toàn nên không thể xử lý.",
            ResponseBlocked => "Phản hồi bị chặn bởi trình quét bảo mật.",
            ServerError => "Lỗi máy chủ nội bộ.",
            UpstreamError => "Dịch vụ thượng nguồn gặp lỗi.",
            ServerBusy => "Máy chủ đang bận, vui lòng thử lại sau.",
            RequestTimeout => "Yêu cầu quá thời gian. Hãy thử lại sau hoặc rút ngắn nội dung.",
            QueueFull => "Hàng đợi yêu cầu đã đầy, máy chủ đang quá tải.",
        },
        "ja" => match key {
            PromptBlocked => "セキュリティスキャナーにより入力がブロックされました。理由: {reason}",
            PromptBlockedDetail => "入力に安全でない内容が含まれているため処理できません。",
            ResponseBlocked => "モデルの出力がセキュリティスキャナーによりブロックされました。",
            ServerError => "サーバー内部エラーが発生しました。",
            UpstreamError => "上流サービスでエラーが発生しました。",
            ServerBusy => "サーバーが混雑しています。しばらくしてから再試行してください。",
            RequestTimeout => "タイムアウトしました。後でもう一度、または短いプロンプトでお試しください。",
            QueueFull => "リクエストキューが満杯です。",
        },
        "ko" => match key {
            PromptBlocked => "보안 스캐너가 입력을 차단했습니다. 이유: {reason}",
            PromptBlockedDetail => "입력에 안전하지 않은 내용이 포함되어 처리할 수 없습니다.",
            ResponseBlocked => "모델 출력이 보안 스캐너에 의해 차단되었습니다.",
            ServerError => "내부 서버 오류가 발생했습니다.",
            UpstreamError => "업스트림 서비스 오류가 발생했습니다.",
            ServerBusy => "서버가 바쁘므로 잠시 후 다시 시도하세요.",
            RequestTimeout => "요청 시간이 초과되었습니다. 프롬프트를 줄이거나 나중에 다시 시도하세요.",
            QueueFull => "요청 대기열이 가득 차 서버가 과부하 상태입니다.",
        },
        "ru" => match key {
            PromptBlocked => "Ваш ввод заблокирован системой безопасности. Причина: {reason}",
            PromptBlockedDetail => "Ввод содержит небезопасный контент и не может быть обработан.",
            ResponseBlocked => "Выход модели заблокирован системой безопасности.",
            ServerError => "Внутренняя ошибка сервера.",
            UpstreamError => "Ошибка во внешнем сервисе.",
            ServerBusy => "Сервер занят. Попробуйте позже.",
            RequestTimeout => "Время ожидания истекло. Попробуйте ещё раз позже или сократите запрос.",
            QueueFull => "Очередь запросов заполнена. Сервер перегружен.",
        },
        "ar" => match key {
            PromptBlocked => "تم حظر الإدخال بواسطة فحص الأمان. السبب: {reason}",
            PromptBlockedDetail => "يحتوي الإدخال على محتوى غير آمن ولا يمكن معالجته.",
            ResponseBlocked => "تم حظر مخرجات النموذج بواسطة فحص الأمان.",
            ServerError => "حدث خطأ داخلي في الخادم.",
            UpstreamError => "حدث خطأ في الخدمة الخارجية.",
            ServerBusy => "الخادم مشغول حاليًا. يرجى المحاولة لاحقًا.",
            RequestTimeout => "انتهت مهلة الطلب. حاول مجددًا لاحقًا أو استخدم مطالبة أقصر.",
            QueueFull => "قائمة الانتظار ممتلئة. الخادم مثقل بالطلبات.",
        },
        "fr" => match key {
            PromptBlocked => "Votre requête a été bloquée par le scanner de sécurité. Raison : {reason}",
            PromptBlockedDetail => "La requête contient un contenu dangereux et ne peut pas être traitée.",
            ResponseBlocked => "La réponse du modèle a été bloquée par le scanner de sécurité.",
            ServerError => "Erreur interne du serveur.",
            UpstreamError => "Erreur du service en amont.",
            ServerBusy => "Le serveur est occupé. Veuillez réessayer plus tard.",
            RequestTimeout => "Délai dépassé. Réessayez plus tard ou réduisez votre requête.",
            QueueFull => "La file d'attente est pleine. Le serveur est surchargé.",
        },
        "de" => match key {
            PromptBlocked => "Ihre Eingabe wurde vom Sicherheitsscanner blockiert. Grund: {reason}",
            PromptBlockedDetail => "Die Eingabe enthält unsichere Inhalte und kann nicht verarbeitet werden.",
            ResponseBlocked => "Die Modellausgabe wurde vom Sicherheitsscanner blockiert.",
            ServerError => "Interner Serverfehler.",
            UpstreamError => "Fehler beim Upstream-Dienst.",
            ServerBusy => "Server ausgelastet. Bitte später erneut versuchen.",
            RequestTimeout => "Zeitüberschreitung. Versuchen Sie es später erneut oder verkürzen Sie die Eingabe.",
            QueueFull => "Die Anfragenwarteschlange ist voll. Server überlastet.",
        },
        "es" => match key {
            PromptBlocked => "Tu entrada fue bloqueada por el escáner de seguridad. Razón: {reason}",
            PromptBlockedDetail => "La entrada contiene contenido inseguro y no puede procesarse.",
            ResponseBlocked => "La salida del modelo fue bloqueada por el escáner de seguridad.",
            ServerError => "Error interno del servidor.",
            UpstreamError => "Error en el servicio ascendente.",
            ServerBusy => "El servidor está ocupado. Inténtalo de nuevo más tarde.",
            RequestTimeout => "La solicitud agotó el tiempo. Intenta nuevamente más tarde o usa un mensaje más corto.",
            QueueFull => "La cola de solicitudes está llena. El servidor está sobrecargado.",
        },
        "pt" => match key {
            PromptBlocked => "Sua entrada foi bloqueada pelo verificador de segurança. Motivo: {reason}",
            PromptBlockedDetail => "A entrada contém conteúdo inseguro e não pode ser processada.",
            ResponseBlocked => "A saída do modelo foi bloqueada pelo verificador de segurança.",
            ServerError => "Erro interno do servidor.",
            UpstreamError => "Erro no serviço upstream.",
            ServerBusy => "Servidor ocupado. Tente novamente mais tarde.",
            RequestTimeout => "Tempo limite atingido. Tente novamente mais tarde ou reduza o prompt.",
            QueueFull => "A fila de solicitações está cheia. Servidor sobrecarregado.",
        },
        _ => match key {
            PromptBlocked => "Your input was blocked by the security scanner. Reason: {reason}",
            PromptBlockedDetail => "Input contains unsafe content and cannot be processed.",
            ResponseBlocked => "Model output was blocked by the security scanner.",
            ServerError => "Internal server error.",
            UpstreamError => "Upstream service error.",
            ServerBusy => "Server is currently busy processing other requests. Please try again later.",
            RequestTimeout => "Request timed out. Please try again with a shorter prompt or later.",
            QueueFull => "Request queue is full. Server is currently overloaded.",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_script_languages() {
        assert_eq!(detect_language("你好，世界"), "zh");
        assert_eq!(detect_language("こんにちは"), "ja");
        assert_eq!(detect_language("안녕하세요"), "ko");
        assert_eq!(detect_language("Привет, как дела?"), "ru");
        assert_eq!(detect_language("مرحبا بالعالم"), "ar");
    }

    #[test]
    fn empty_and_unknown_default_to_english() {
        assert_eq!(detect_language(""), "en");
        assert_eq!(detect_language("12345 !!!"), "en");
    }

    #[test]
    fn detection_is_total_over_arbitrary_input() {
        for text in ["\u{0}", "🦀🦀🦀", "a", "   ", "ß"] {
            let code = detect_language(text);
            assert!(SUPPORTED_LANGUAGES.contains(&code.as_str()), "got {code}");
        }
    }

    #[test]
    fn normalizes_aliases() {
        assert_eq!(normalize_lang_code("zh-CN"), "zh");
        assert_eq!(normalize_lang_code("pt-BR"), "pt");
        assert_eq!(normalize_lang_code("en-US"), "en");
        assert_eq!(normalize_lang_code("xx"), "en");
        assert_eq!(normalize_lang_code(""), "en");
    }

    #[test]
    fn message_reason_substitution() {
        let msg = localized_message(MessageKey::PromptBlocked, "en", Some("secrets: risk 92%"));
        assert!(msg.contains("secrets: risk 92%"));

        // No reason slot in this key, reason is ignored.
        let msg = localized_message(MessageKey::ServerBusy, "en", Some("ignored"));
        assert!(!msg.contains("ignored"));
    }

    #[test]
    fn unknown_language_falls_back_to_english() {
        let en = localized_message(MessageKey::QueueFull, "en", None);
        let xx = localized_message(MessageKey::QueueFull, "tlh", None);
        assert_eq!(en, xx);
    }

    #[test]
    fn all_supported_languages_have_messages() {
        for lang in SUPPORTED_LANGUAGES {
            let msg = localized_message(MessageKey::ResponseBlocked, lang, None);
            assert!(!msg.is_empty());
        }
    }
}
