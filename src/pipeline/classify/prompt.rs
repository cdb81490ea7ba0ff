use crate::models::Category;

use super::ClassificationRequest;

/// Build the classifier prompt for one content sample.
pub fn build_classification_prompt(request: &ClassificationRequest) -> String {
    let categories = Category::DOMAIN
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {} ({}) - {}", i + 1, c.as_str(), c.label_zh(), describe(c)))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Decide whether the document below is a medical document. If it is, pick its \
category and the date of the examination or treatment it records.\n\n\
File name: {file}\n\n\
[Document content, first characters]\n{sample}\n\n\
[Categories]\n{categories}\n\
Anything that is not a medical document, or fits none of these, is \"other\".\n\n\
[Date rules]\n\
- Reports (lab, imaging, pathology, physical exam): sampling or examination date.\n\
- Clinical records (diagnosis, surgery, nursing): visit, operation or record date.\n\
- Prescriptions: date issued.\n\
- Several dates: the earliest examination or treatment date.\n\n\
Reply with JSON only:\n\
{{\"category\": \"<category>\", \"exam_date\": \"YYYY-MM-DD or null\", \"note\": \"<short remark>\"}}",
        file = request.file_name,
        sample = request.sample_text,
    )
}

fn describe(category: &Category) -> &'static str {
    match category {
        Category::LabReport => "blood, urine, biochemistry and other laboratory results",
        Category::ImagingReport => "CT, MRI, X-ray, ultrasound reports",
        Category::PathologyReport => "histopathology, biopsy, cytology reports",
        Category::DiagnosisReport => "diagnoses, outpatient and inpatient records",
        Category::Prescription => "medication prescriptions and instructions",
        Category::SurgeryRecord => "operation notes and surgical reports",
        Category::NursingRecord => "nursing observations and care plans",
        Category::PhysicalExam => "general health check-up reports",
        Category::Other => "anything else",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn prompt_lists_every_domain_category_and_sample() {
        let prompt = build_classification_prompt(&ClassificationRequest {
            record_id: Uuid::new_v4(),
            file_name: "cbc.pdf".into(),
            sample_text: "WBC 6.2".into(),
        });
        for category in Category::DOMAIN {
            assert!(prompt.contains(category.as_str()));
        }
        assert!(prompt.contains("WBC 6.2"));
        assert!(prompt.contains("cbc.pdf"));
        assert!(prompt.contains("\"exam_date\""));
    }
}
